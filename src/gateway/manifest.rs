//! Install manifest: resources to prefetch, grouped into ordered batches.

use serde::{Deserialize, Serialize};

/// A resource path to prefetch at install time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ManifestEntry(String);

impl ManifestEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

/// Entries stored together in the cache set named `label`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ManifestBatch {
    pub label: String,
    pub entries: Vec<ManifestEntry>,
}

impl ManifestBatch {
    pub fn new<I, S>(label: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            entries: entries.into_iter().map(ManifestEntry::new).collect(),
        }
    }
}

/// Ordered install batches. Batch N+1 is only installed after batch N is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Manifest {
    batches: Vec<ManifestBatch>,
}

impl Manifest {
    pub fn new(batches: Vec<ManifestBatch>) -> Self {
        Self { batches }
    }

    /// The two-generation offline manifest: page shell in `v2`, script and
    /// fallback page in `v3`.
    pub fn offline_default() -> Self {
        Self::new(vec![
            ManifestBatch::new("v2", ["/", "/index.html", "/styles/main.css"]),
            ManifestBatch::new("v3", ["/script/main.js", "/fallback.html"]),
        ])
    }

    pub fn batches(&self) -> &[ManifestBatch] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batch labels in declaration order, without duplicates.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            if !labels.contains(&batch.label.as_str()) {
                labels.push(batch.label.as_str());
            }
        }
        labels
    }

    pub fn entry_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.entries.len()).sum()
    }

    /// Check labels and paths. Returns a reason on the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        for (index, batch) in self.batches.iter().enumerate() {
            if batch.label.trim().is_empty() {
                return Err(format!("batch {index} has an empty label"));
            }
            for entry in &batch.entries {
                if !entry.path().starts_with('/') {
                    return Err(format!(
                        "entry `{}` in batch `{}` must start with `/`",
                        entry.path(),
                        batch.label
                    ));
                }
            }
        }
        Ok(())
    }
}
