//! Cache storage.
//!
//! Responses live in named, versioned cache sets. The gateway only talks to
//! storage through [`CacheStorage`]; [`MemoryCacheStorage`] is the in-process
//! implementation used by the server.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::gateway::GatewayResponse;

use super::keys::RequestKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache set `{label}` does not exist")]
    UnknownCacheSet { label: String },
    #[error("cache storage failure: {message}")]
    Backend { message: String },
}

impl StorageError {
    pub fn unknown(label: impl Into<String>) -> Self {
        Self::UnknownCacheSet {
            label: label.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Registry of versioned cache sets.
///
/// Lookups that do not name a set search every set in creation order and
/// return the first match.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open the cache set for `label`, creating it when absent.
    async fn open(&self, label: &str) -> Result<(), StorageError>;

    /// Store `response` under `key` in an existing set, replacing any previous entry.
    async fn put(
        &self,
        label: &str,
        key: RequestKey,
        response: GatewayResponse,
    ) -> Result<(), StorageError>;

    /// Store a group of entries in one set.
    async fn put_all(
        &self,
        label: &str,
        entries: Vec<(RequestKey, GatewayResponse)>,
    ) -> Result<(), StorageError> {
        for (key, response) in entries {
            self.put(label, key, response).await?;
        }
        Ok(())
    }

    /// Find `key` in any cache set.
    async fn match_any(&self, key: &RequestKey) -> Result<Option<GatewayResponse>, StorageError>;

    /// Find `key` in the set named `label` only.
    async fn match_in(
        &self,
        label: &str,
        key: &RequestKey,
    ) -> Result<Option<GatewayResponse>, StorageError>;

    /// Labels of all cache sets, in creation order.
    async fn labels(&self) -> Result<Vec<String>, StorageError>;

    /// Delete the set named `label`. Returns `false` when it did not exist.
    async fn delete(&self, label: &str) -> Result<bool, StorageError>;

    async fn snapshot(&self) -> Result<Vec<CacheSetSummary>, StorageError>;
}

/// Serializable description of one cache set.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSetSummary {
    pub label: String,
    pub entries: Vec<CacheEntrySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySummary {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body_bytes: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
}

#[derive(Clone)]
struct StoredEntry {
    response: GatewayResponse,
    stored_at: OffsetDateTime,
}

struct CacheSet {
    label: String,
    entries: BTreeMap<RequestKey, StoredEntry>,
}

impl CacheSet {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            entries: BTreeMap::new(),
        }
    }

    fn summary(&self) -> CacheSetSummary {
        CacheSetSummary {
            label: self.label.clone(),
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| CacheEntrySummary {
                    method: key.method().to_string(),
                    url: key.url().to_string(),
                    status: entry.response.status.as_u16(),
                    content_type: entry.response.content_type().map(str::to_string),
                    body_bytes: entry.response.body.len(),
                    stored_at: entry.stored_at,
                })
                .collect(),
        }
    }
}

/// In-memory cache storage owned by a gateway instance.
///
/// No lock is held across an `.await`; every operation completes under a
/// single guard.
#[derive(Default)]
pub struct MemoryCacheStorage {
    sets: RwLock<Vec<CacheSet>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the set named `label`, if it exists.
    pub fn entry_count(&self, label: &str) -> Option<usize> {
        rw_read(&self.sets, SOURCE, "entry_count")
            .iter()
            .find(|set| set.label == label)
            .map(|set| set.entries.len())
    }

    fn insert(
        &self,
        label: &str,
        entries: Vec<(RequestKey, GatewayResponse)>,
    ) -> Result<(), StorageError> {
        let mut sets = rw_write(&self.sets, SOURCE, "put");
        let set = sets
            .iter_mut()
            .find(|set| set.label == label)
            .ok_or_else(|| StorageError::unknown(label))?;

        let stored_at = OffsetDateTime::now_utc();
        for (key, response) in entries {
            set.entries.insert(
                key,
                StoredEntry {
                    response,
                    stored_at,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, label: &str) -> Result<(), StorageError> {
        let mut sets = rw_write(&self.sets, SOURCE, "open");
        if !sets.iter().any(|set| set.label == label) {
            sets.push(CacheSet::new(label));
        }
        Ok(())
    }

    async fn put(
        &self,
        label: &str,
        key: RequestKey,
        response: GatewayResponse,
    ) -> Result<(), StorageError> {
        self.insert(label, vec![(key, response)])
    }

    async fn put_all(
        &self,
        label: &str,
        entries: Vec<(RequestKey, GatewayResponse)>,
    ) -> Result<(), StorageError> {
        self.insert(label, entries)
    }

    async fn match_any(&self, key: &RequestKey) -> Result<Option<GatewayResponse>, StorageError> {
        Ok(rw_read(&self.sets, SOURCE, "match_any")
            .iter()
            .find_map(|set| set.entries.get(key))
            .map(|entry| entry.response.clone()))
    }

    async fn match_in(
        &self,
        label: &str,
        key: &RequestKey,
    ) -> Result<Option<GatewayResponse>, StorageError> {
        Ok(rw_read(&self.sets, SOURCE, "match_in")
            .iter()
            .find(|set| set.label == label)
            .and_then(|set| set.entries.get(key))
            .map(|entry| entry.response.clone()))
    }

    async fn labels(&self) -> Result<Vec<String>, StorageError> {
        Ok(rw_read(&self.sets, SOURCE, "labels")
            .iter()
            .map(|set| set.label.clone())
            .collect())
    }

    async fn delete(&self, label: &str) -> Result<bool, StorageError> {
        let mut sets = rw_write(&self.sets, SOURCE, "delete");
        let before = sets.len();
        sets.retain(|set| set.label != label);
        Ok(sets.len() != before)
    }

    async fn snapshot(&self) -> Result<Vec<CacheSetSummary>, StorageError> {
        Ok(rw_read(&self.sets, SOURCE, "snapshot")
            .iter()
            .map(CacheSet::summary)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use axum::http::{HeaderValue, StatusCode, header};

    use super::*;

    fn html(body: &'static str) -> GatewayResponse {
        GatewayResponse::ok(body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
    }

    #[tokio::test]
    async fn put_and_match_roundtrip() {
        let storage = MemoryCacheStorage::new();
        storage.open("v2").await.expect("open v2");

        let key = RequestKey::get("/index.html");
        assert!(storage.match_any(&key).await.expect("lookup").is_none());

        storage
            .put("v2", key.clone(), html("<h1>hi</h1>"))
            .await
            .expect("put");

        let cached = storage
            .match_in("v2", &key)
            .await
            .expect("lookup")
            .expect("cached response");
        assert_eq!(cached.status, StatusCode::OK);
        assert_eq!(cached.body, "<h1>hi</h1>");
    }

    #[tokio::test]
    async fn put_into_unopened_set_fails() {
        let storage = MemoryCacheStorage::new();
        let err = storage
            .put("v9", RequestKey::get("/"), html("x"))
            .await
            .expect_err("set was never opened");
        assert!(matches!(err, StorageError::UnknownCacheSet { label } if label == "v9"));
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let storage = MemoryCacheStorage::new();
        storage.open("v2").await.expect("open");
        let key = RequestKey::get("/styles/main.css");

        storage.put("v2", key.clone(), html("old")).await.expect("put");
        storage.put("v2", key.clone(), html("new")).await.expect("put");

        assert_eq!(storage.entry_count("v2"), Some(1));
        let cached = storage.match_any(&key).await.expect("lookup").expect("hit");
        assert_eq!(cached.body, "new");
    }

    #[tokio::test]
    async fn match_any_prefers_earliest_set() {
        let storage = MemoryCacheStorage::new();
        storage.open("v2").await.expect("open v2");
        storage.open("v3").await.expect("open v3");
        let key = RequestKey::get("/");

        storage.put("v3", key.clone(), html("from v3")).await.expect("put");
        storage.put("v2", key.clone(), html("from v2")).await.expect("put");

        let cached = storage.match_any(&key).await.expect("lookup").expect("hit");
        assert_eq!(cached.body, "from v2");
    }

    #[tokio::test]
    async fn open_is_idempotent_and_keeps_creation_order() {
        let storage = MemoryCacheStorage::new();
        for label in ["v1", "v2", "v1", "v3"] {
            storage.open(label).await.expect("open");
        }
        assert_eq!(
            storage.labels().await.expect("labels"),
            vec!["v1".to_string(), "v2".to_string(), "v3".to_string()]
        );
    }

    #[tokio::test]
    async fn delete_reports_whether_set_existed() {
        let storage = MemoryCacheStorage::new();
        storage.open("v1").await.expect("open");

        assert!(storage.delete("v1").await.expect("delete"));
        assert!(!storage.delete("v1").await.expect("delete"));
        assert!(storage.labels().await.expect("labels").is_empty());
    }

    #[tokio::test]
    async fn snapshot_describes_entries() {
        let storage = MemoryCacheStorage::new();
        storage.open("v2").await.expect("open");
        storage
            .put_all(
                "v2",
                vec![
                    (RequestKey::get("/"), html("root")),
                    (RequestKey::get("/index.html"), html("index")),
                ],
            )
            .await
            .expect("put_all");

        let snapshot = storage.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].label, "v2");
        let urls: Vec<&str> = snapshot[0].entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["/", "/index.html"]);
        assert_eq!(snapshot[0].entries[1].body_bytes, 5);
        assert_eq!(
            snapshot[0].entries[0].content_type.as_deref(),
            Some("text/html; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn storage_recovers_from_poisoned_lock() {
        let storage = MemoryCacheStorage::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = storage
                .sets
                .write()
                .expect("sets lock should be acquired");
            panic!("poison cache sets lock");
        }));

        storage.open("v2").await.expect("open after poison");
        assert_eq!(storage.entry_count("v2"), Some(0));
    }
}
