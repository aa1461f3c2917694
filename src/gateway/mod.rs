//! Offline cache gateway.
//!
//! Three lifecycle hooks drive the cache sets:
//!
//! - **install** prefetches the manifest, one batch (cache set) at a time;
//! - **activate** deletes every cache set whose label is not whitelisted;
//! - **intercept** answers a request from cache, then origin, then the
//!   fallback resource.
//!
//! ```text
//! Lookup ──hit──────────────────────────────▶ cached response
//!   │ miss
//!   ▼
//! Fetch ──error────────┐
//!   │                  ▼
//! Validate ──reject──▶ Fallback ──absent──▶ FallbackMissing
//!   │ accept
//!   ▼
//! Store (write cache) ─▶ origin response
//! ```

mod config;
mod error;
mod fetch;
mod manifest;
mod message;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use futures::future::{join_all, try_join_all};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheSetSummary, CacheStorage, RequestKey, StorageError};

pub use self::config::GatewayConfig;
pub(crate) use self::config::{DEFAULT_FALLBACK_PATH, DEFAULT_WRITE_CACHE, labels_of};
pub use error::GatewayError;
pub use fetch::{FetchError, FetchedResponse, OriginFetch, ResponseKind};
pub use manifest::{Manifest, ManifestBatch, ManifestEntry};
pub use message::{GatewayRequest, GatewayResponse};

pub(crate) const METRIC_INTERCEPT_HIT_TOTAL: &str = "cachegate_intercept_hit_total";
pub(crate) const METRIC_INTERCEPT_MISS_TOTAL: &str = "cachegate_intercept_miss_total";
pub(crate) const METRIC_INTERCEPT_FALLBACK_TOTAL: &str = "cachegate_intercept_fallback_total";
pub(crate) const METRIC_INTERCEPT_FALLBACK_MISSING_TOTAL: &str = "cachegate_intercept_fallback_missing_total";
pub(crate) const METRIC_INSTALL_ENTRY_TOTAL: &str = "cachegate_install_entry_total";
pub(crate) const METRIC_ACTIVATE_DELETED_TOTAL: &str = "cachegate_activate_deleted_total";
pub(crate) const METRIC_ORIGIN_FETCH_MS: &str = "cachegate_origin_fetch_ms";

/// How an intercepted request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptOutcome {
    /// Served from a cache set without touching the origin.
    Hit,
    /// Fetched from the origin and written to the write cache.
    Stored,
    /// Fetched from the origin and passed through uncached (non-`GET`).
    Network,
    /// Origin failed or was unusable; the fallback resource was served.
    Fallback,
}

impl InterceptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Stored => "stored",
            Self::Network => "network",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Intercepted {
    pub response: GatewayResponse,
    pub outcome: InterceptOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub batches: Vec<InstalledBatch>,
}

impl InstallReport {
    pub fn entry_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.entries).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstalledBatch {
    pub label: String,
    pub entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<FailedDeletion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDeletion {
    pub label: String,
    pub reason: String,
}

/// Request-interception policy over explicitly owned cache storage.
pub struct CacheGateway {
    config: GatewayConfig,
    storage: Arc<dyn CacheStorage>,
    origin: Arc<dyn OriginFetch>,
}

impl CacheGateway {
    pub fn new(
        config: GatewayConfig,
        storage: Arc<dyn CacheStorage>,
        origin: Arc<dyn OriginFetch>,
    ) -> Self {
        Self {
            config,
            storage,
            origin,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Prefetch every manifest batch into its cache set, in declaration order.
    ///
    /// A batch is written only after all of its entries were fetched and
    /// accepted. The first failing entry abandons the run; batches stored
    /// before it stay cached.
    #[instrument(skip_all, fields(batches = manifest.batches().len()))]
    pub async fn install(&self, manifest: &Manifest) -> Result<InstallReport, GatewayError> {
        let mut report = InstallReport::default();

        for batch in manifest.batches() {
            match self.install_batch(batch).await {
                Ok(stored) => {
                    counter!(METRIC_INSTALL_ENTRY_TOTAL, "label" => batch.label.clone())
                        .increment(stored as u64);
                    info!(label = %batch.label, entries = stored, "cache batch stored");
                    report.batches.push(InstalledBatch {
                        label: batch.label.clone(),
                        entries: stored,
                    });
                }
                Err(err) => {
                    error!(
                        error = %err,
                        stored_batches = report.batches.len(),
                        "manifest prefetch failed; install abandoned"
                    );
                    return Err(err);
                }
            }
        }

        info!(entries = report.entry_count(), "all manifest resources cached");
        Ok(report)
    }

    async fn install_batch(&self, batch: &ManifestBatch) -> Result<usize, GatewayError> {
        self.storage.open(&batch.label).await.map_err(|err| {
            GatewayError::install_fetch(&batch.label, "*", format!("cannot open cache: {err}"))
        })?;

        let fetched = try_join_all(
            batch
                .entries
                .iter()
                .map(|entry| self.prefetch_entry(&batch.label, entry)),
        )
        .await?;

        let stored = fetched.len();
        self.storage
            .put_all(&batch.label, fetched)
            .await
            .map_err(|err| {
                GatewayError::install_fetch(&batch.label, "*", format!("cannot store: {err}"))
            })?;
        Ok(stored)
    }

    async fn prefetch_entry(
        &self,
        label: &str,
        entry: &ManifestEntry,
    ) -> Result<(RequestKey, GatewayResponse), GatewayError> {
        let request = GatewayRequest::get(entry.path());
        let fetched = self
            .origin
            .fetch(&request)
            .await
            .map_err(|err| GatewayError::install_fetch(label, entry.path(), err.to_string()))?;

        if !is_acceptable(&fetched) {
            return Err(GatewayError::install_fetch(
                label,
                entry.path(),
                format!(
                    "unusable response (status {}, kind {})",
                    fetched.response.status,
                    fetched.kind.as_str()
                ),
            ));
        }

        debug!(label, path = entry.path(), "prefetched manifest entry");
        Ok((request.key(), fetched.response))
    }

    /// Delete every cache set whose label is not in `whitelist`.
    ///
    /// Deletions run concurrently; a failed deletion is logged and reported
    /// without affecting the others. Labels are compared verbatim.
    #[instrument(skip_all, fields(whitelist = ?whitelist))]
    pub async fn activate(
        &self,
        whitelist: &BTreeSet<String>,
    ) -> Result<ActivationReport, GatewayError> {
        let labels = self.storage.labels().await.inspect_err(|err| {
            error!(error = %err, "cache cleanup failed: cannot enumerate cache sets");
        })?;

        let (kept, stale): (Vec<String>, Vec<String>) = labels
            .into_iter()
            .partition(|label| whitelist.contains(label));

        let outcomes = join_all(stale.into_iter().map(|label| async move {
            let result = self.storage.delete(&label).await;
            (label, result)
        }))
        .await;

        let mut report = ActivationReport {
            kept,
            ..Default::default()
        };
        for (label, result) in outcomes {
            match result {
                Ok(true) => {
                    counter!(METRIC_ACTIVATE_DELETED_TOTAL).increment(1);
                    info!(label = %label, "stale cache deleted");
                    report.deleted.push(label);
                }
                Ok(false) => debug!(label = %label, "stale cache already gone"),
                Err(source) => {
                    let err = GatewayError::ActivationDelete {
                        label: label.clone(),
                        source,
                    };
                    warn!(error = %err, "stale cache could not be deleted");
                    report.failed.push(FailedDeletion {
                        label,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "cache cleanup complete"
        );
        Ok(report)
    }

    /// Answer `request` from cache, origin, or the fallback resource.
    ///
    /// The only error returned is [`GatewayError::FallbackMissing`].
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn intercept(&self, request: &GatewayRequest) -> Result<Intercepted, GatewayError> {
        let cacheable = request.is_cacheable_method();
        let key = request.key();

        if cacheable {
            match self.storage.match_any(&key).await {
                Ok(Some(response)) => {
                    counter!(METRIC_INTERCEPT_HIT_TOTAL).increment(1);
                    debug!(cache = "hit", "serving cached response");
                    return Ok(Intercepted {
                        response,
                        outcome: InterceptOutcome::Hit,
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "cache lookup failed; treating as miss"),
            }
        }

        counter!(METRIC_INTERCEPT_MISS_TOTAL).increment(1);
        debug!(cache = "miss", "fetching from origin");

        let started_at = Instant::now();
        let fetched = self.origin.fetch(request).await;
        histogram!(METRIC_ORIGIN_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        match fetched {
            Ok(fetched) if is_acceptable(&fetched) => {
                let outcome = if cacheable {
                    self.write_through(key, fetched.response.clone()).await;
                    InterceptOutcome::Stored
                } else {
                    InterceptOutcome::Network
                };
                Ok(Intercepted {
                    response: fetched.response,
                    outcome,
                })
            }
            Ok(fetched) => {
                let err = GatewayError::InvalidResponse {
                    url: request.url.clone(),
                    status: fetched.response.status,
                    kind: fetched.kind,
                };
                debug!(error = %err, "origin response rejected; serving fallback");
                self.fallback().await
            }
            Err(source) => {
                let err = GatewayError::OriginFetch {
                    url: request.url.clone(),
                    source,
                };
                warn!(error = %err, "origin unreachable; serving fallback");
                self.fallback().await
            }
        }
    }

    async fn write_through(&self, key: RequestKey, response: GatewayResponse) {
        let label = self.config.write_cache.as_str();
        let stored = match self.storage.open(label).await {
            Ok(()) => self.storage.put(label, key, response).await,
            Err(err) => Err(err),
        };
        // The caller still receives the origin response when the write fails.
        if let Err(err) = stored {
            warn!(error = %err, label, "failed to cache origin response");
        }
    }

    async fn fallback(&self) -> Result<Intercepted, GatewayError> {
        let path = self.config.fallback_path.as_str();
        let found = self
            .storage
            .match_any(&RequestKey::get(path))
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, path, "fallback lookup failed");
                None
            });

        match found {
            Some(response) => {
                counter!(METRIC_INTERCEPT_FALLBACK_TOTAL).increment(1);
                Ok(Intercepted {
                    response,
                    outcome: InterceptOutcome::Fallback,
                })
            }
            None => {
                counter!(METRIC_INTERCEPT_FALLBACK_MISSING_TOTAL).increment(1);
                Err(GatewayError::fallback_missing(path))
            }
        }
    }

    /// Labels of all cache sets, in creation order.
    pub async fn cache_names(&self) -> Result<Vec<String>, StorageError> {
        self.storage.labels().await
    }

    pub async fn snapshot(&self) -> Result<Vec<CacheSetSummary>, StorageError> {
        self.storage.snapshot().await
    }
}

/// Only direct, same-origin `200 OK` responses are cached or served as-is.
fn is_acceptable(fetched: &FetchedResponse) -> bool {
    fetched.response.status == StatusCode::OK && fetched.kind == ResponseKind::Basic
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::Method;

    use super::*;
    use crate::cache::MemoryCacheStorage;

    /// Origin answering from a fixed table and recording every request.
    #[derive(Default)]
    struct TableOrigin {
        routes: HashMap<String, FetchedResponse>,
        calls: Mutex<Vec<String>>,
    }

    impl TableOrigin {
        fn with(mut self, url: &str, fetched: FetchedResponse) -> Self {
            self.routes.insert(url.to_string(), fetched);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl OriginFetch for TableOrigin {
        async fn fetch(&self, request: &GatewayRequest) -> Result<FetchedResponse, FetchError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(request.url.clone());
            self.routes
                .get(&request.url)
                .cloned()
                .ok_or_else(|| FetchError::transport(&request.url, "connection refused"))
        }
    }

    fn page(body: &'static str) -> FetchedResponse {
        FetchedResponse::basic(GatewayResponse::ok(body))
    }

    fn gateway(origin: Arc<TableOrigin>) -> (CacheGateway, Arc<MemoryCacheStorage>) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let gateway = CacheGateway::new(GatewayConfig::default(), storage.clone(), origin);
        (gateway, storage)
    }

    #[test]
    fn acceptance_requires_ok_and_basic() {
        assert!(is_acceptable(&page("x")));

        let created = FetchedResponse::basic(GatewayResponse::new(StatusCode::CREATED, "x"));
        assert!(!is_acceptable(&created));

        let opaque = FetchedResponse {
            kind: ResponseKind::Opaque,
            response: GatewayResponse::ok("x"),
        };
        assert!(!is_acceptable(&opaque));
    }

    #[tokio::test]
    async fn non_get_requests_bypass_cache() {
        let origin = Arc::new(TableOrigin::default().with("/submit", page("accepted")));
        let (gateway, storage) = gateway(origin.clone());

        let request = GatewayRequest::new(Method::POST, "/submit");
        let first = gateway.intercept(&request).await.expect("response");
        let second = gateway.intercept(&request).await.expect("response");

        assert_eq!(first.outcome, InterceptOutcome::Network);
        assert_eq!(second.outcome, InterceptOutcome::Network);
        assert_eq!(origin.calls().len(), 2);
        assert_eq!(storage.entry_count("v2"), None);
    }

    #[tokio::test]
    async fn write_cache_is_created_on_first_store() {
        let origin = Arc::new(TableOrigin::default().with("/about.html", page("about")));
        let (gateway, storage) = gateway(origin);

        let intercepted = gateway
            .intercept(&GatewayRequest::get("/about.html"))
            .await
            .expect("response");

        assert_eq!(intercepted.outcome, InterceptOutcome::Stored);
        assert_eq!(storage.entry_count("v2"), Some(1));
    }

    #[tokio::test]
    async fn install_fetches_each_entry_once() {
        let origin = Arc::new(
            TableOrigin::default()
                .with("/", page("root"))
                .with("/index.html", page("index")),
        );
        let (gateway, _) = gateway(origin.clone());
        let manifest = Manifest::new(vec![ManifestBatch::new("v2", ["/", "/index.html"])]);

        let report = gateway.install(&manifest).await.expect("install");

        assert_eq!(report.entry_count(), 2);
        let mut calls = origin.calls();
        calls.sort();
        assert_eq!(calls, vec!["/".to_string(), "/index.html".to_string()]);
    }

    #[tokio::test]
    async fn activation_with_no_caches_is_a_no_op() {
        let (gateway, _) = gateway(Arc::new(TableOrigin::default()));
        let report = gateway
            .activate(&BTreeSet::from(["v2".to_string()]))
            .await
            .expect("activate");
        assert!(report.kept.is_empty());
        assert!(report.deleted.is_empty());
        assert!(report.failed.is_empty());
    }

    #[test]
    fn outcome_names() {
        assert_eq!(InterceptOutcome::Hit.as_str(), "hit");
        assert_eq!(InterceptOutcome::Stored.as_str(), "stored");
        assert_eq!(InterceptOutcome::Network.as_str(), "network");
        assert_eq!(InterceptOutcome::Fallback.as_str(), "fallback");
    }
}
