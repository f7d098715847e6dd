//! Content-addressed digest type

use crate::error::{CasError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;

/// SHA256 of the empty blob, in `hash/size` form
pub const EMPTY_DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/0";

/// A content-addressed digest (SHA256 hash + size).
///
/// Digests are value types; two blobs with equal digests are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// SHA256 hash in hex format
    pub hash: String,

    /// Size of the content in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Create a digest from a hash string and size, validating the hash.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CasError::InvalidDigest(format!(
                "expected 64 hex characters, got '{hash}'"
            )));
        }

        Ok(Self { hash, size_bytes })
    }

    /// Compute the digest of a byte slice.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);

        Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: bytes.len() as i64,
        }
    }

    /// Parse a digest from `hash/size` format.
    pub fn parse(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| CasError::InvalidDigest(format!("expected 'hash/size', got '{s}'")))?;

        let size_bytes: i64 = size
            .parse()
            .map_err(|_| CasError::InvalidDigest(format!("invalid size '{size}'")))?;

        Self::new(hash, size_bytes)
    }

    /// Whether this digest names the empty blob.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// The hash component.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The size component.
    #[must_use]
    pub fn size(&self) -> i64 {
        self.size_bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self {
            hash: EMPTY_DIGEST
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            size_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_matches_known_hash() {
        let digest = Digest::from_bytes(b"hello world");
        assert_eq!(digest.size_bytes, 11);
        assert_eq!(
            digest.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn new_rejects_bad_hashes() {
        assert!(Digest::new("a".repeat(64), 1).is_ok());
        assert!(Digest::new("a".repeat(32), 1).is_err());
        assert!(Digest::new(format!("{}g", "a".repeat(63)), 1).is_err());
    }

    #[test]
    fn parse_round_trips_display() {
        let digest = Digest::from_bytes(b"payload");
        let parsed = Digest::parse(&digest.to_string()).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Digest::parse("nope").is_err());
        assert!(Digest::parse("hash/notanumber").is_err());
    }

    #[test]
    fn default_is_the_empty_digest() {
        let digest = Digest::default();
        assert!(digest.is_empty());
        assert_eq!(digest.to_string(), EMPTY_DIGEST);
        assert_eq!(digest, Digest::from_bytes(b""));
    }
}
