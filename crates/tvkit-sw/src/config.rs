//! Cache worker configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tvkit_common::TvKitError;

/// Configuration baked into one worker version.
///
/// Bumping `cache_version` is the only thing that makes a deployed worker
/// count as an update. Editing `seed_manifest` alone does not re-seed
/// existing installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name of the cache generation this worker owns.
    pub cache_version: String,

    /// Root-relative paths fetched and cached at install time.
    pub seed_manifest: Vec<String>,

    /// Requests whose path contains this are never cached.
    pub admin_marker: String,

    /// Requests whose path contains this are never cached.
    pub api_marker: String,

    /// Become eligible for activation right after install.
    pub skip_waiting_on_install: bool,

    /// Take control of every open page on activation.
    pub claim_on_activate: bool,

    /// Upper bound on a single network fetch, in seconds.
    pub network_timeout_secs: u64,

    /// Attempts per stale generation when purging on activation.
    pub cleanup_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_version: "tvkit-cache-v1".to_string(),
            seed_manifest: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            admin_marker: "/admin".to_string(),
            api_marker: "/api".to_string(),
            skip_waiting_on_install: true,
            claim_on_activate: true,
            network_timeout_secs: 30,
            cleanup_attempts: 3,
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> tvkit_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TvKitError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> tvkit_common::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TvKitError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json(&json)
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> tvkit_common::Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(TvKitError::config("cache_version must not be empty"));
        }
        if let Some(bad) = self.seed_manifest.iter().find(|p| !p.starts_with('/')) {
            return Err(TvKitError::config(format!(
                "seed path '{bad}' must be root-relative"
            )));
        }
        if self.admin_marker.is_empty() || self.api_marker.is_empty() {
            return Err(TvKitError::config("exclusion markers must not be empty"));
        }
        if self.network_timeout_secs == 0 {
            return Err(TvKitError::config("network_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Network timeout as a duration.
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}

/// Where and how much the cache storage may keep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Mirror generations to JSON files in this directory.
    pub persist_dir: Option<PathBuf>,

    /// Upper bound on the summed body size of all entries.
    pub quota_bytes: Option<usize>,
}
