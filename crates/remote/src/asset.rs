//! The remote asset cache contract
//!
//! A remote holds content-addressed blobs plus named references mapping
//! URIs to blob digests. The artifact cache drives push and pull entirely
//! through this trait; wire-protocol implementations live outside this
//! repository.

use crate::error::Result;
use async_trait::async_trait;
use weir_cas::Digest;

/// One configured remote cache endpoint
#[async_trait]
pub trait AssetRemote: Send + Sync {
    /// Look up the first of `uris` that resolves, returning its digest.
    ///
    /// A miss returns `Ok(None)`; errors are reserved for transport and
    /// policy failures.
    async fn fetch_reference(&self, uris: &[String]) -> Result<Option<Digest>>;

    /// Point every uri in `uris` at `digest`.
    ///
    /// The remote first verifies that `digest` itself, all
    /// `referenced_blobs`, and the transitive closure of
    /// `referenced_directories` are present on its side, failing with
    /// `BlobNotFound` otherwise.
    async fn push_reference(
        &self,
        uris: &[String],
        digest: &Digest,
        referenced_blobs: &[Digest],
        referenced_directories: &[Digest],
    ) -> Result<()>;

    /// Whether the remote holds a blob.
    async fn has_blob(&self, digest: &Digest) -> Result<bool>;

    /// Upload one blob.
    async fn upload_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<()>;

    /// Download one blob; missing blobs fail with `BlobNotFound`.
    async fn download_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// The subset of `digests` the remote does not have.
    async fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>>;

    /// Whether pushes are enabled for this remote.
    fn push_enabled(&self) -> bool;

    /// Human-readable endpoint description for log messages.
    fn describe(&self) -> String;
}
