//! Artifact records and the artifact cache for weir
//!
//! An artifact is the cached output of building one element, stored as a
//! canonical record blob and named `project/element/cache-key`. The cache
//! manages those named refs locally (with LRU eviction under a quota) and
//! transfers artifacts to and from remote asset caches.

pub mod artifact;
pub mod cache;
pub mod error;
pub mod quota;

pub use artifact::{Artifact, ArtifactName, LogEntry, ARTIFACT_URN_TEMPLATE, ARTIFACT_VERSION};
pub use cache::{ArtifactCache, EvictionResult};
pub use error::{ArtifactError, Result};
pub use quota::CacheUsage;
