use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::gateway::{
    METRIC_ACTIVATE_DELETED_TOTAL, METRIC_INSTALL_ENTRY_TOTAL, METRIC_INTERCEPT_FALLBACK_MISSING_TOTAL,
    METRIC_INTERCEPT_FALLBACK_TOTAL, METRIC_INTERCEPT_HIT_TOTAL, METRIC_INTERCEPT_MISS_TOTAL,
    METRIC_ORIGIN_FETCH_MS,
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// `RUST_LOG` directives take precedence over the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_INTERCEPT_HIT_TOTAL,
            Unit::Count,
            "Requests answered from a cache set."
        );
        describe_counter!(
            METRIC_INTERCEPT_MISS_TOTAL,
            Unit::Count,
            "Requests forwarded to the origin after a cache miss."
        );
        describe_counter!(
            METRIC_INTERCEPT_FALLBACK_TOTAL,
            Unit::Count,
            "Requests answered with the fallback resource."
        );
        describe_counter!(
            METRIC_INTERCEPT_FALLBACK_MISSING_TOTAL,
            Unit::Count,
            "Requests that failed because the fallback resource was not cached."
        );
        describe_counter!(
            METRIC_INSTALL_ENTRY_TOTAL,
            Unit::Count,
            "Manifest entries stored during install."
        );
        describe_counter!(
            METRIC_ACTIVATE_DELETED_TOTAL,
            Unit::Count,
            "Stale cache sets deleted during activation."
        );
        describe_histogram!(
            METRIC_ORIGIN_FETCH_MS,
            Unit::Milliseconds,
            "Origin fetch latency in milliseconds."
        );
    });
}
