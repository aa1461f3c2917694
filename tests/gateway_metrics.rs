mod support;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use cachegate::cache::{CacheStorage, MemoryCacheStorage};
use cachegate::gateway::{GatewayRequest, Manifest};
use cachegate::infra::telemetry;
use metrics::Unit;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serial_test::serial;

use support::{ScriptedOrigin, gateway_over, whitelist};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

/// Sum of a counter across all of its label sets.
fn counter_total(name: &str) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

#[tokio::test]
#[serial]
async fn lifecycle_emits_expected_metric_keys() {
    let snapshotter = snapshotter();

    let storage = Arc::new(MemoryCacheStorage::new());
    let origin = Arc::new(ScriptedOrigin::demo_site());
    let gateway = gateway_over(storage.clone(), origin.clone());

    storage.open("v1").await.expect("open stale set");
    gateway
        .install(&Manifest::offline_default())
        .await
        .expect("install succeeds");
    gateway
        .activate(&whitelist(&["v2", "v3"]))
        .await
        .expect("activate succeeds");

    for path in ["/index.html", "/about.html", "/missing.js"] {
        gateway
            .intercept(&GatewayRequest::get(path))
            .await
            .expect("response");
    }
    origin.serve("/about.html", "about");
    gateway
        .intercept(&GatewayRequest::get("/about.html"))
        .await
        .expect("response");

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "cachegate_intercept_hit_total",
        "cachegate_intercept_miss_total",
        "cachegate_intercept_fallback_total",
        "cachegate_install_entry_total",
        "cachegate_activate_deleted_total",
        "cachegate_origin_fetch_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let install_labels: HashSet<String> = snapshot
        .iter()
        .filter(|(key, _, _, _)| key.key().name() == "cachegate_install_entry_total")
        .flat_map(|(key, _, _, _)| {
            key.key()
                .labels()
                .filter(|label| label.key() == "label")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(install_labels.contains("v2"));
    assert!(install_labels.contains("v3"));

    let undescribed: Vec<&str> = snapshot
        .iter()
        .filter(|(_, _, description, _)| description.is_none())
        .map(|(key, _, _, _)| key.key().name())
        .filter(|name| name.starts_with("cachegate_"))
        .collect();
    assert!(undescribed.is_empty(), "metrics without description: {undescribed:?}");

    let fetch_unit = snapshot
        .iter()
        .find(|(key, _, _, _)| key.key().name() == "cachegate_origin_fetch_ms")
        .and_then(|(_, unit, _, _)| *unit);
    assert_eq!(fetch_unit, Some(Unit::Milliseconds));
}

#[tokio::test]
#[serial]
async fn missing_fallback_is_counted() {
    let before = counter_total("cachegate_intercept_fallback_missing_total");

    let origin = Arc::new(ScriptedOrigin::new());
    origin.go_offline();
    let gateway = gateway_over(Arc::new(MemoryCacheStorage::new()), origin);

    gateway
        .intercept(&GatewayRequest::get("/index.html"))
        .await
        .expect_err("no fallback cached");

    assert_eq!(
        counter_total("cachegate_intercept_fallback_missing_total"),
        before + 1
    );
}
