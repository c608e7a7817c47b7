//! Peer registries: discovery, mutable root slots, and logical names.
//!
//! Each registry is a small trait with an in-memory implementation, a
//! persistent implementation backed by [`invariant_durable::DurableMap`]
//! where state must survive restarts, an axum HTTP server, and a reqwest
//! client speaking the same protocol.

pub mod discovery;
pub mod discovery_client;
/// Protocol tokens services advertise through discovery.
pub mod protocol {
    /// Content-addressed blob storage peer.
    pub const STORAGE: &str = "storage-v1";
    /// Location index (finder) peer.
    pub const FINDER: &str = "finder-v1";
    /// Replication controller.
    pub const DISTRIBUTE: &str = "distribute-v1";
    /// Slot registry.
    pub const SLOTS: &str = "slots-v1";
    /// Name registry.
    pub const NAMES: &str = "names-v1";
    /// Block-holding notification consumer.
    pub const HAS: &str = "has-v1";
}
pub mod discovery_server;
pub mod identity;
pub mod names;
pub mod names_client;
pub mod names_server;
pub mod slots;
pub mod slots_client;
pub mod slots_server;

pub use discovery::{Discovery, MemoryDiscovery, ServiceDescription, ServiceRegistration};
pub use discovery_client::DiscoveryClient;
pub use names::{MemoryNames, NameEntry, NameStore, PersistentNames};
pub use names_client::NamesClient;
pub use slots::{MemorySlots, PersistentSlots, SlotStore};
pub use slots_client::SlotsClient;

use invariant_durable::DurableError;
use thiserror::Error;

/// Errors shared by the registry clients and backends.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Create of an entry that already exists.
    #[error("already exists: {0}")]
    Conflict(String),
    /// A compare-and-swap expectation did not hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The operation is not supported by this backend.
    #[error("operation not supported")]
    NotSupported,
    /// Malformed input (bad id, missing field).
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Network-level failure talking to a remote registry.
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote registry answered with an unexpected status code.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
    /// Persistence failure in the durable backend.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        RegistryError::Transport(e.to_string())
    }
}

impl From<DurableError> for RegistryError {
    fn from(e: DurableError) -> Self {
        match e {
            DurableError::NotFound(key) => RegistryError::NotFound(key),
            DurableError::Conflict(key) => RegistryError::Conflict(key),
            DurableError::PreconditionFailed { key } => RegistryError::PreconditionFailed(key),
            DurableError::Serde(e) => RegistryError::BadRequest(e.to_string()),
            DurableError::Io(e) => RegistryError::Io(e),
        }
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, RegistryError>;
