//! User-facing configuration for the build core
//!
//! These structs are the deserialization target for whatever configuration
//! loader sits in front of the core. Defaults are chosen so that an empty
//! configuration gives a working local-only setup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a weir invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the local cache (objects, refs, logs)
    pub cache_dir: Option<PathBuf>,

    /// Cache quota settings
    pub quota: QuotaConfig,

    /// Maximum concurrent build jobs
    pub builders: usize,

    /// Maximum concurrent fetch/pull jobs
    pub fetchers: usize,

    /// Maximum concurrent push jobs
    pub pushers: usize,

    /// Retry count for network operations
    pub network_retries: u32,

    /// Whether pulled artifacts also fetch their build trees
    pub pull_buildtrees: bool,

    /// Continue building unrelated elements after a failure
    pub keep_going: bool,

    /// Configured remote caches, in priority order
    pub remotes: Vec<RemoteSpecConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            quota: QuotaConfig::default(),
            builders: 4,
            fetchers: 10,
            pushers: 4,
            network_retries: 2,
            pull_buildtrees: false,
            keep_going: false,
            remotes: Vec::new(),
        }
    }
}

/// Cache quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum cache size in bytes; `None` disables quota enforcement
    pub quota_bytes: Option<u64>,

    /// Eviction target as a fraction of the quota
    pub low_ratio: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            low_ratio: 0.5,
        }
    }
}

impl QuotaConfig {
    /// The byte count eviction aims for once the quota is exceeded
    #[must_use]
    pub fn low_watermark(&self) -> Option<u64> {
        self.quota_bytes
            .map(|q| (q as f64 * self.low_ratio.clamp(0.0, 1.0)) as u64)
    }
}

/// A configured remote cache endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSpecConfig {
    /// Endpoint location; `file:` URLs and plain paths resolve to a
    /// directory-backed remote
    pub url: String,

    /// Whether this remote accepts pushes
    #[serde(default)]
    pub push: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local_only() {
        let config = Config::default();
        assert!(config.remotes.is_empty());
        assert!(config.quota.quota_bytes.is_none());
        assert_eq!(config.builders, 4);
        assert!(!config.pull_buildtrees);
    }

    #[test]
    fn low_watermark_is_half_quota_by_default() {
        let quota = QuotaConfig {
            quota_bytes: Some(1000),
            ..QuotaConfig::default()
        };
        assert_eq!(quota.low_watermark(), Some(500));
    }

    #[test]
    fn deserialize_partial_config() {
        let config: Config =
            serde_json::from_str(r#"{"builders": 2, "remotes": [{"url": "file:///tmp/r"}]}"#)
                .unwrap();
        assert_eq!(config.builders, 2);
        assert_eq!(config.remotes.len(), 1);
        assert!(!config.remotes[0].push);
    }
}
