//! Replication controller and the `distribute-v1` protocol.
//!
//! Storage peers register here and keep the controller informed of what
//! they hold. A periodic sync pass finds under-replicated blocks and
//! commands the XOR-closest non-holders to fetch them, with a direct relay
//! as the fallback and eviction for peers that keep failing.

pub mod client;
pub mod controller;
pub mod server;

pub use client::DistributeClient;
pub use controller::{ReplicationConfig, ReplicationController};

use thiserror::Error;

/// Errors produced by the replication layer.
#[derive(Debug, Error)]
pub enum ReplicateError {
    /// Network-level failure talking to a remote service.
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote service answered with an unexpected status code.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

impl From<reqwest::Error> for ReplicateError {
    fn from(e: reqwest::Error) -> Self {
        ReplicateError::Transport(e.to_string())
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ReplicateError>;
