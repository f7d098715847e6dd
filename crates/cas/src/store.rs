//! Local content-addressed object store
//!
//! Blobs live under `objects/<hh>/<rest-of-hash>`, named refs under
//! `refs/heads/<name>`, and all writes go through a scratch directory
//! `tmp/` followed by an atomic rename. Renames make concurrent puts of
//! the same digest safe across processes; the loser of the race simply
//! replaces identical bytes.

use crate::digest::Digest;
use crate::error::{CasError, Result};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A flat content-addressed blob store on a local filesystem path
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["objects", "refs/heads", "tmp"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| CasError::io("create_dir_all", dir, e))?;
        }
        Ok(Self { root })
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path_for(&self, digest: &Digest) -> PathBuf {
        let hash = digest.hash();
        self.root.join("objects").join(&hash[0..2]).join(&hash[2..])
    }

    fn refs_dir(&self) -> PathBuf {
        self.root.join("refs/heads")
    }

    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("put-{}-{seq}", std::process::id()))
    }

    /// Write `bytes` into the store and return their digest.
    ///
    /// Idempotent: storing a blob that already exists is a no-op beyond
    /// hashing. Running out of disk space surfaces as
    /// [`CasError::CacheFull`].
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::from_bytes(bytes);
        let dest = self.object_path_for(&digest);

        if dest.exists() {
            return Ok(digest);
        }

        let tmp = self.temp_path();
        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| CasError::io("create", tmp.clone(), e))?;
            file.write_all(bytes)
                .map_err(|e| CasError::io("write", tmp.clone(), e))?;
            file.sync_all()
                .map_err(|e| CasError::io("sync", tmp.clone(), e))?;
        }
        self.commit_temp(&tmp, &dest)?;

        debug!(digest = %digest, "Stored object");
        Ok(digest)
    }

    /// Hash a file on disk and link (or copy) it into the store.
    ///
    /// The executable bit is deliberately not part of the blob identity;
    /// it belongs to the directory entry referring to the blob.
    pub fn put_path(&self, path: &Path) -> Result<Digest> {
        let mut file = fs::File::open(path).map_err(|e| CasError::io("open", path, e))?;
        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| CasError::io("read", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as i64;
        }
        let digest = Digest {
            hash: hex::encode(hasher.finalize()),
            size_bytes: size,
        };

        let dest = self.object_path_for(&digest);
        if dest.exists() {
            return Ok(digest);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CasError::io("create_dir_all", parent.to_path_buf(), e))?;
        }

        // Hard link where possible; fall back to an atomic copy.
        if fs::hard_link(path, &dest).is_err() {
            let tmp = self.temp_path();
            fs::copy(path, &tmp).map_err(|e| CasError::io("copy", tmp.clone(), e))?;
            self.commit_temp(&tmp, &dest)?;
        }

        Ok(digest)
    }

    fn commit_temp(&self, tmp: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CasError::io("create_dir_all", parent.to_path_buf(), e))?;
        }
        fs::rename(tmp, dest).map_err(|e| CasError::io("rename", dest.to_path_buf(), e))
    }

    /// On-disk path of a blob; fails with `NotFound` if absent.
    pub fn object_path(&self, digest: &Digest) -> Result<PathBuf> {
        let path = self.object_path_for(digest);
        if path.exists() {
            Ok(path)
        } else {
            Err(CasError::not_found(digest))
        }
    }

    /// Whether the store holds a blob.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path_for(digest).exists()
    }

    /// Read a blob, verifying its content against the digest.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest)?;
        let bytes = fs::read(&path).map_err(|e| CasError::io("read", path, e))?;

        if Digest::from_bytes(&bytes) != *digest {
            return Err(CasError::CorruptBlob {
                digest: digest.to_string(),
            });
        }

        Ok(bytes)
    }

    /// Delete a blob, returning the bytes freed.
    pub fn remove_object(&self, digest: &Digest) -> Result<u64> {
        let path = self.object_path_for(digest);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(0),
        };
        fs::remove_file(&path).map_err(|e| CasError::io("remove_file", path, e))?;
        Ok(size)
    }

    /// Enumerate every blob as `(hash, size)` pairs.
    pub fn list_objects(&self) -> Result<Vec<(String, u64)>> {
        let mut objects = Vec::new();
        let objects_dir = self.root.join("objects");

        for entry in WalkDir::new(&objects_dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                CasError::io(
                    "walk",
                    objects_dir.clone(),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walkdir error")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let prefix = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let rest = entry.file_name().to_string_lossy().to_string();
            objects.push((format!("{prefix}{rest}"), entry.metadata().map(|m| m.len()).unwrap_or(0)));
        }

        Ok(objects)
    }

    /// Total bytes held by blobs.
    pub fn usage(&self) -> Result<u64> {
        Ok(self.list_objects()?.iter().map(|(_, size)| size).sum())
    }

    ////////////////////////////////////////
    //            Ref index               //
    ////////////////////////////////////////

    fn ref_path(&self, name: &str) -> PathBuf {
        self.refs_dir().join(name)
    }

    /// Point a named ref at a digest (atomic write).
    pub fn set_ref(&self, name: &str, digest: &Digest) -> Result<()> {
        let dest = self.ref_path(name);
        let tmp = self.temp_path();
        fs::write(&tmp, digest.to_string()).map_err(|e| CasError::io("write", tmp.clone(), e))?;
        self.commit_temp(&tmp, &dest)
    }

    /// Resolve a named ref to its digest.
    pub fn resolve_ref(&self, name: &str) -> Result<Digest> {
        let path = self.ref_path(name);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::RefNotFound {
                    name: name.to_string(),
                }
            } else {
                CasError::io("read", path.clone(), e)
            }
        })?;
        Digest::parse(text.trim())
    }

    /// Whether a named ref exists.
    #[must_use]
    pub fn has_ref(&self, name: &str) -> bool {
        self.ref_path(name).exists()
    }

    /// Update a ref's mtime to mark recent use.
    pub fn touch_ref(&self, name: &str) -> Result<()> {
        let path = self.ref_path(name);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CasError::RefNotFound {
                        name: name.to_string(),
                    }
                } else {
                    CasError::io("open", path.clone(), e)
                }
            })?;
        file.set_modified(SystemTime::now())
            .map_err(|e| CasError::io("set_modified", path, e))
    }

    /// Delete a ref, pruning now-empty parent directories bottom-up.
    pub fn remove_ref(&self, name: &str) -> Result<()> {
        let path = self.ref_path(name);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::RefNotFound {
                    name: name.to_string(),
                }
            } else {
                CasError::io("remove_file", path.clone(), e)
            }
        })?;

        let refs_dir = self.refs_dir();
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == refs_dir || fs::remove_dir(&d).is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Iterate all refs as `(name, mtime)`, sorted oldest-first.
    ///
    /// The ordering drives LRU eviction.
    pub fn list_refs(&self) -> Result<Vec<(String, SystemTime)>> {
        let refs_dir = self.refs_dir();
        let mut refs = Vec::new();

        for entry in WalkDir::new(&refs_dir).min_depth(1) {
            let entry = entry.map_err(|e| {
                CasError::io(
                    "walk",
                    refs_dir.clone(),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walkdir error")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(&refs_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            refs.push((name, mtime));
        }

        refs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(refs)
    }
}
