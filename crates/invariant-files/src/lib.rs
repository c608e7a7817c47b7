//! File-tree engine: a logical file system layered on the blob store.
//!
//! Directories serialize to JSON manifests written through the content
//! codec; a writable tree publishes each new root address through a slot
//! registry's compare-and-swap. The in-memory node graph loads lazily and
//! tracks dirty ancestry so a sync only rewrites what changed.

pub mod engine;
pub mod manifest;
pub mod server;

pub use engine::{EntryAttributes, FileTree, FileTreeConfig, NodeInfo, ROOT_NODE};
pub use manifest::{Entry, EntryKind, EntryMeta};

use invariant_content::ContentError;
use invariant_registry::RegistryError;
use thiserror::Error;

/// Errors produced by the file-tree engine.
#[derive(Debug, Error)]
pub enum FileTreeError {
    /// Mutation attempted on a read-only tree.
    #[error("file tree is read-only")]
    ReadOnly,
    /// No node with this id exists.
    #[error("unknown node: {0}")]
    UnknownNode(u64),
    /// The named entry does not exist in the directory.
    #[error("entry {name:?} not found in node {parent}")]
    EntryNotFound {
        /// Directory node id.
        parent: u64,
        /// Child name that was looked up.
        name: String,
    },
    /// The node is not a directory.
    #[error("node {0} is not a directory")]
    NotADirectory(u64),
    /// The node is not a file.
    #[error("node {0} is not a file")]
    NotAFile(u64),
    /// The slot CAS lost against a concurrent writer.
    #[error("root publication conflict on slot {0}")]
    CasConflict(String),
    /// A directory blob did not parse as a manifest.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    /// Invalid name, mode, or other caller mistake.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Content codec failure under this tree.
    #[error(transparent)]
    Content(#[from] ContentError),
    /// Slot registry failure other than a CAS conflict.
    #[error("slot registry error: {0}")]
    Slot(String),
}

impl From<RegistryError> for FileTreeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::PreconditionFailed(slot) => FileTreeError::CasConflict(slot),
            other => FileTreeError::Slot(other.to_string()),
        }
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, FileTreeError>;
