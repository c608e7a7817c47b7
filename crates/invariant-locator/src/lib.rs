//! Block location fabric: the XOR metric, the k-bucket routing table, and
//! the location index that answers "who has address X?".
//!
//! Peer ids and block addresses share one 256-bit space and one metric, so a
//! block's "closest peers" are well-defined and every node ranks them the
//! same way.

pub mod client;
pub mod has;
pub mod kademlia;
pub mod locator;
pub mod server;

pub use client::FinderClient;
pub use has::{HasClient, HasNotifier, HasNotifierConfig};
pub use kademlia::{PeerId, RoutingTable, BUCKET_SIZE};
pub use locator::{FindResponse, HasRequest, Locator, MemoryLocator};

use thiserror::Error;

/// Errors produced by the location fabric.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// An id or block address is not 64 lowercase hex characters.
    #[error("malformed id or address: {0}")]
    MalformedId(String),
    /// Network-level failure talking to a remote peer.
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote peer answered with an unexpected status code.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

impl From<reqwest::Error> for LocatorError {
    fn from(e: reqwest::Error) -> Self {
        LocatorError::Transport(e.to_string())
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, LocatorError>;
