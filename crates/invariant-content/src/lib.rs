//! Content codec: the deterministic split → compress → encrypt → address
//! pipeline and its inverse.
//!
//! A write turns an arbitrary byte sequence into one or more immutable
//! blobs plus a [`ContentLink`], a self-describing recipe for getting the
//! bytes back. A read walks the link's transforms in order, fetching blobs
//! lazily and checking the expected SHA-256 at end of stream.

pub mod chunker;
pub mod cipher;
pub mod compress;
pub mod link;
pub mod reader;
pub mod writer;

pub use chunker::BuzHash;
pub use link::{BlockList, BlockListItem, Compression, ContentLink, Transform};
pub use reader::{read, read_to_vec, ContentStream};
pub use writer::{write, KeyPolicy, WriterOptions};

use invariant_storage::StorageError;
use thiserror::Error;

/// Errors produced while writing or reconstructing content. All are
/// terminal for the stream that raised them.
#[derive(Debug, Error)]
pub enum ContentError {
    /// A referenced blob is absent from the storage surface.
    #[error("block not found: {0}")]
    BlockNotFound(String),
    /// A transform kind or algorithm this codec does not understand.
    #[error("unsupported transform: {0}")]
    UnsupportedTransform(String),
    /// Decryption, padding, or key material problem.
    #[error("cipher error: {0}")]
    Cipher(String),
    /// The reconstructed bytes do not hash to the expected digest.
    #[error("integrity error: expected {expected}, got {actual}")]
    Integrity {
        /// Digest the link promised.
        expected: String,
        /// Digest of what was actually reconstructed.
        actual: String,
    },
    /// The link is a slot reference but no slot registry is configured.
    #[error("slot link requires a slot registry")]
    SlotServiceMissing,
    /// Slot lookup failed.
    #[error("slot lookup failed: {0}")]
    Slot(String),
    /// A block list blob did not parse.
    #[error("malformed block list: {0}")]
    MalformedBlockList(String),
    /// Compression or decompression failure.
    #[error("compression error: {0}")]
    Compress(String),
    /// The stream already failed; no further reads are possible.
    #[error("stream previously failed")]
    StreamFailed,
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ContentError>;
