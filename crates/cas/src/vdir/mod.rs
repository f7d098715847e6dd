//! Virtual directory trees
//!
//! Two interchangeable directory implementations sit behind the same
//! operation set: [`CasTree`] stages and edits Merkle trees inside the
//! object store, [`FsDirectory`] does the same over a real filesystem
//! path. Imports accept either variant as a source via [`ImportSource`].

mod cas_tree;
mod fs_dir;

pub use cas_tree::{CasTree, EntryKind, NodeId};
pub use fs_dir::{list_relative_paths as fs_list_relative_paths, FsDirectory};

use std::path::Path;

/// The type of one directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A subdirectory
    Directory,
    /// A regular file
    RegularFile,
    /// A symbolic link
    Symlink,
    /// Anything else (device nodes, sockets, ...)
    SpecialFile,
}

/// Accumulated outcome of an import operation
#[derive(Debug, Default, Clone)]
pub struct FileListResult {
    /// Files, symlinks and directories written into the target
    pub files_written: Vec<String>,
    /// Paths in the target that were replaced
    pub overwritten: Vec<String>,
    /// Paths that could not be imported (e.g. collisions with non-empty
    /// directories)
    pub ignored: Vec<String>,
    /// Paths whose permissions or ownership could not be applied
    pub failed_attributes: Vec<String>,
}

impl FileListResult {
    /// Fold another result into this one.
    pub fn combine(&mut self, other: FileListResult) {
        self.files_written.extend(other.files_written);
        self.overwritten.extend(other.overwritten);
        self.ignored.extend(other.ignored);
        self.failed_attributes.extend(other.failed_attributes);
    }
}

/// The source side of an import operation
pub enum ImportSource<'a> {
    /// A real filesystem directory
    Fs(&'a Path),
    /// A node in a (different) CAS tree
    Cas(&'a mut CasTree, NodeId),
}

/// Join two relative path fragments with `/`, eliding empty prefixes.
pub(crate) fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
