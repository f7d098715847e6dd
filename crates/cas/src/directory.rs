//! Merkle directory objects
//!
//! A directory serializes to a canonical message of three name-sorted
//! lists: subdirectories, files and symlinks. Its digest is the digest of
//! that canonical encoding, so a directory's identity is a function solely
//! of its logical contents, and a root digest transitively covers every
//! blob underneath it.

use crate::digest::Digest;
use crate::error::{CasError, Result};
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named subdirectory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    /// Entry name, unique within the directory
    pub name: String,
    /// Digest of the child directory object
    pub digest: Digest,
}

/// A named regular-file entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Entry name, unique within the directory
    pub name: String,
    /// Digest of the file blob
    pub digest: Digest,
    /// Whether the file is executable
    pub is_executable: bool,
}

/// A named symlink entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkNode {
    /// Entry name, unique within the directory
    pub name: String,
    /// Symlink target path, stored verbatim
    pub target: String,
}

/// One logical entry used when building a [`Directory`] from a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEntry {
    /// A subdirectory with a known digest
    Directory(Digest),
    /// A regular file
    File {
        /// Blob digest
        digest: Digest,
        /// Executable bit
        is_executable: bool,
    },
    /// A symlink
    Symlink(String),
}

/// A canonical Merkle directory object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Subdirectories, sorted by name
    pub directories: Vec<DirectoryNode>,
    /// Regular files, sorted by name
    pub files: Vec<FileNode>,
    /// Symlinks, sorted by name
    pub symlinks: Vec<SymlinkNode>,
}

impl Directory {
    /// Build a directory from an entry map.
    ///
    /// The `BTreeMap` input guarantees both sortedness and that a name
    /// appears in at most one of the three lists.
    #[must_use]
    pub fn from_entries(entries: &BTreeMap<String, DirEntry>) -> Self {
        let mut dir = Self::default();
        for (name, entry) in entries {
            match entry {
                DirEntry::Directory(digest) => dir.directories.push(DirectoryNode {
                    name: name.clone(),
                    digest: digest.clone(),
                }),
                DirEntry::File {
                    digest,
                    is_executable,
                } => dir.files.push(FileNode {
                    name: name.clone(),
                    digest: digest.clone(),
                    is_executable: *is_executable,
                }),
                DirEntry::Symlink(target) => dir.symlinks.push(SymlinkNode {
                    name: name.clone(),
                    target: target.clone(),
                }),
            }
        }
        dir
    }

    /// Whether the directory has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty() && self.symlinks.is_empty()
    }

    /// Canonical byte encoding: lists sorted by name, stable field order.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.directories.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.files.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.symlinks.sort_by(|a, b| a.name.cmp(&b.name));

        serde_json::to_vec(&canonical).map_err(|e| CasError::decode(e.to_string()))
    }

    /// Decode a directory from its canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CasError::decode(e.to_string()))
    }

    /// Digest of the canonical encoding.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::from_bytes(&self.encode()?))
    }

    /// Serialize and write into the store, returning the digest.
    pub fn store(&self, store: &ObjectStore) -> Result<Digest> {
        store.put_bytes(&self.encode()?)
    }

    /// Read and decode a directory blob.
    pub fn load(store: &ObjectStore, digest: &Digest) -> Result<Self> {
        Self::decode(&store.read(digest)?)
    }
}

/// Compute the transitive closure of blobs referenced by a directory.
///
/// The returned list includes the root directory blob itself, every
/// subdirectory blob, and every file blob, each digest exactly once.
pub fn required_blobs(store: &ObjectStore, root: &Digest) -> Result<Vec<Digest>> {
    let mut seen: BTreeMap<String, Digest> = BTreeMap::new();
    let mut queue = vec![root.clone()];

    while let Some(dir_digest) = queue.pop() {
        if seen.contains_key(dir_digest.hash()) {
            continue;
        }
        let directory = Directory::load(store, &dir_digest)?;
        seen.insert(dir_digest.hash().to_string(), dir_digest);

        for file in &directory.files {
            seen.entry(file.digest.hash().to_string())
                .or_insert_with(|| file.digest.clone());
        }
        for subdir in &directory.directories {
            queue.push(subdir.digest.clone());
        }
    }

    Ok(seen.into_values().collect())
}
