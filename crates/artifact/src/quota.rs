//! Cache size accounting against the configured quota
//!
//! Commits bump an estimate as they land; the scheduler triggers a real
//! size check (and eviction) once the estimate crosses the quota. The
//! estimate deliberately over-counts between checks; eviction corrects it.

use std::sync::atomic::{AtomicU64, Ordering};
use weir_core::QuotaConfig;

/// Tracks estimated local cache usage against a quota
#[derive(Debug)]
pub struct CacheUsage {
    quota: Option<u64>,
    low_watermark: Option<u64>,
    estimated: AtomicU64,
}

impl CacheUsage {
    /// Build usage tracking from quota configuration.
    #[must_use]
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            quota: config.quota_bytes,
            low_watermark: config.low_watermark(),
            estimated: AtomicU64::new(0),
        }
    }

    /// The configured quota, if any.
    #[must_use]
    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    /// The byte count eviction aims for.
    #[must_use]
    pub fn low_watermark(&self) -> Option<u64> {
        self.low_watermark
    }

    /// Add a freshly committed artifact's size to the estimate.
    pub fn add_artifact_size(&self, size: u64) {
        self.estimated.fetch_add(size, Ordering::Relaxed);
    }

    /// Replace the estimate with a measured size.
    pub fn set_measured(&self, size: u64) {
        self.estimated.store(size, Ordering::Relaxed);
    }

    /// The current estimate.
    #[must_use]
    pub fn estimated(&self) -> u64 {
        self.estimated.load(Ordering::Relaxed)
    }

    /// Whether the estimate has crossed the quota.
    #[must_use]
    pub fn full(&self) -> bool {
        match self.quota {
            Some(quota) => self.estimated() > quota,
            None => false,
        }
    }
}
