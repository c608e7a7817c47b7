//! Content-addressed blob storage.
//!
//! A blob is an immutable byte sequence keyed by the lowercase-hex SHA-256
//! of its bytes. This crate provides the storage surface
//! (`has/get/store/store_at/size` plus a new-block feed), an in-memory and
//! an on-disk implementation, the `storage-v1` HTTP protocol, and the
//! aggregate client that fans reads out across live peers with location
//! caching and failover.

pub mod aggregate;
pub mod client;
pub mod fs;
pub mod memory;
pub mod server;
pub mod store;

pub use aggregate::{AggregateClient, AggregateClientConfig};
pub use client::StorageClient;
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use store::{is_valid_address, BlobStore, BlockFeed};

use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The address is not 64 lowercase hex characters.
    #[error("malformed address: {0}")]
    MalformedAddress(String),
    /// No live storage peer could serve the request.
    #[error("no live storage peers available")]
    Unavailable,
    /// Network-level failure or 5xx from a peer; the peer is presumed dead.
    #[error("transient peer failure: {0}")]
    Transient(String),
    /// The peer answered with an unexpected status code.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
    /// The peer's fetch endpoint could not obtain the block upstream.
    #[error("fetch failed upstream: {0}")]
    FetchFailed(String),
    /// Local filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Transient(e.to_string())
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, StorageError>;
