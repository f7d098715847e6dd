//! Content-addressed storage for weir
//!
//! Three layers build on each other here: the [`store::ObjectStore`] keeps
//! raw blobs and named refs on disk; [`directory::Directory`] gives blobs
//! Merkle-tree structure; and [`vdir`] provides editable virtual directory
//! trees over either the store or a real filesystem, including the symlink
//! resolver and the import overlay rule.

pub mod digest;
pub mod directory;
pub mod error;
pub mod gc;
pub mod store;
pub mod vdir;

pub use digest::{Digest, EMPTY_DIGEST};
pub use directory::{required_blobs, DirEntry, Directory, DirectoryNode, FileNode, SymlinkNode};
pub use error::{CasError, Result};
pub use gc::{sweep, GcResult};
pub use store::ObjectStore;
pub use vdir::{
    fs_list_relative_paths, CasTree, EntryKind, FileListResult, FileType, FsDirectory,
    ImportSource, NodeId,
};
