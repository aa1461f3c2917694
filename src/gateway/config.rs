//! Gateway configuration.
//!
//! Resolved from the `[gateway]` section of `cachegate.toml`.

use std::collections::BTreeSet;

use super::manifest::Manifest;

pub(crate) const DEFAULT_WRITE_CACHE: &str = "v2";
pub(crate) const DEFAULT_FALLBACK_PATH: &str = "/fallback.html";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Cache set that receives write-through entries on a cache miss.
    pub write_cache: String,
    /// Path of the resource served when neither cache nor origin can answer.
    pub fallback_path: String,
    /// Labels kept by activation; every other cache set is deleted.
    pub whitelist: BTreeSet<String>,
    /// Resources prefetched by install.
    pub manifest: Manifest,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let manifest = Manifest::offline_default();
        Self {
            write_cache: DEFAULT_WRITE_CACHE.to_string(),
            fallback_path: DEFAULT_FALLBACK_PATH.to_string(),
            whitelist: labels_of(&manifest),
            manifest,
        }
    }
}

impl From<&crate::config::GatewaySettings> for GatewayConfig {
    fn from(settings: &crate::config::GatewaySettings) -> Self {
        Self {
            write_cache: settings.write_cache.clone(),
            fallback_path: settings.fallback_path.clone(),
            whitelist: settings.whitelist.clone(),
            manifest: settings.manifest.clone(),
        }
    }
}

impl GatewayConfig {
    /// Whether write-through entries survive the next activation.
    pub fn write_cache_is_whitelisted(&self) -> bool {
        self.whitelist.contains(&self.write_cache)
    }
}

pub(crate) fn labels_of(manifest: &Manifest) -> BTreeSet<String> {
    manifest
        .labels()
        .into_iter()
        .map(str::to_string)
        .collect()
}
