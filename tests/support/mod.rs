//! Shared doubles for gateway integration tests.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
use cachegate::cache::{
    CacheSetSummary, CacheStorage, MemoryCacheStorage, RequestKey, StorageError,
};
use cachegate::gateway::{
    CacheGateway, FetchError, FetchedResponse, GatewayConfig, GatewayRequest, GatewayResponse,
    OriginFetch, ResponseKind,
};

/// Origin that answers from a route table and counts every fetch.
///
/// Unknown paths answer `404`, like a static file server.
#[derive(Default)]
pub struct ScriptedOrigin {
    routes: Mutex<HashMap<String, FetchedResponse>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl ScriptedOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Origin serving every path of the offline demo manifest.
    pub fn demo_site() -> Self {
        let origin = Self::new();
        for (path, body) in [
            ("/", "<h1>home</h1>"),
            ("/index.html", "<h1>index</h1>"),
            ("/styles/main.css", "body { color: black; }"),
            ("/script/main.js", "console.log('hi');"),
            ("/fallback.html", "<h1>offline</h1>"),
        ] {
            origin.serve(path, body);
        }
        origin
    }

    pub fn serve(&self, path: &str, body: &str) {
        let response = GatewayResponse::ok(body.to_string())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        self.respond(path, FetchedResponse::basic(response));
    }

    pub fn respond(&self, path: &str, fetched: FetchedResponse) {
        self.routes
            .lock()
            .expect("routes lock")
            .insert(path.to_string(), fetched);
    }

    pub fn respond_with(&self, path: &str, kind: ResponseKind, status: StatusCode, body: &str) {
        self.respond(
            path,
            FetchedResponse {
                kind,
                response: GatewayResponse::new(status, body.to_string()),
            },
        );
    }

    /// Make every subsequent fetch fail at the transport level.
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls().iter().filter(|url| url.as_str() == path).count()
    }
}

#[async_trait]
impl OriginFetch for ScriptedOrigin {
    async fn fetch(&self, request: &GatewayRequest) -> Result<FetchedResponse, FetchError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.url.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::transport(&request.url, "connection refused"));
        }

        let routes = self.routes.lock().expect("routes lock");
        Ok(routes.get(&request.url).cloned().unwrap_or_else(|| {
            FetchedResponse::basic(GatewayResponse::new(
                StatusCode::NOT_FOUND,
                "file not found",
            ))
        }))
    }
}

/// Storage wrapper whose `delete` fails for selected labels.
pub struct FlakyDeleteStorage {
    inner: MemoryCacheStorage,
    undeletable: BTreeSet<String>,
}

impl FlakyDeleteStorage {
    pub fn new(undeletable: &[&str]) -> Self {
        Self {
            inner: MemoryCacheStorage::new(),
            undeletable: undeletable.iter().map(|label| label.to_string()).collect(),
        }
    }
}

#[async_trait]
impl CacheStorage for FlakyDeleteStorage {
    async fn open(&self, label: &str) -> Result<(), StorageError> {
        self.inner.open(label).await
    }

    async fn put(
        &self,
        label: &str,
        key: RequestKey,
        response: GatewayResponse,
    ) -> Result<(), StorageError> {
        self.inner.put(label, key, response).await
    }

    async fn match_any(&self, key: &RequestKey) -> Result<Option<GatewayResponse>, StorageError> {
        self.inner.match_any(key).await
    }

    async fn match_in(
        &self,
        label: &str,
        key: &RequestKey,
    ) -> Result<Option<GatewayResponse>, StorageError> {
        self.inner.match_in(label, key).await
    }

    async fn labels(&self) -> Result<Vec<String>, StorageError> {
        self.inner.labels().await
    }

    async fn delete(&self, label: &str) -> Result<bool, StorageError> {
        if self.undeletable.contains(label) {
            return Err(StorageError::backend(format!("`{label}` is locked")));
        }
        self.inner.delete(label).await
    }

    async fn snapshot(&self) -> Result<Vec<CacheSetSummary>, StorageError> {
        self.inner.snapshot().await
    }
}

pub fn demo_config() -> GatewayConfig {
    GatewayConfig::default()
}

pub fn gateway_over(
    storage: Arc<dyn CacheStorage>,
    origin: Arc<ScriptedOrigin>,
) -> CacheGateway {
    CacheGateway::new(demo_config(), storage, origin)
}

pub fn whitelist(labels: &[&str]) -> BTreeSet<String> {
    labels.iter().map(|label| label.to_string()).collect()
}

pub fn body_text(response: &GatewayResponse) -> String {
    String::from_utf8(response.body.to_vec()).expect("utf-8 body")
}
