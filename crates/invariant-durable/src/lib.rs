//! Durable key/value map: snapshot + append-only journal + atomic rotation.
//!
//! The slot and name registries share this persistence pattern. Every
//! mutation appends one JSON line to the active journal and fsyncs before the
//! write lock is released, so a crash never loses an acknowledged update. A
//! periodic snapshot collapses the journal history into `snapshot.json` and
//! deletes superseded journal files.

pub mod map;

pub use map::{DurableMap, DurableMapConfig};

use thiserror::Error;

/// Errors produced by the durable map.
#[derive(Debug, Error)]
pub enum DurableError {
    /// The key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),
    /// The key already exists and cannot be created again.
    #[error("key already exists: {0}")]
    Conflict(String),
    /// A compare-and-swap expectation did not hold.
    #[error("precondition failed for key {key}: stored value does not match expected")]
    PreconditionFailed {
        /// The key whose expectation failed.
        key: String,
    },
    /// Serialization of a journal record or snapshot failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, DurableError>;
