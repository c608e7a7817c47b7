//! The location index: block address → set of storage peers, with a
//! Kademlia routing table as the fallback when an address is unknown.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use invariant_registry::protocol;

use crate::kademlia::{PeerId, RoutingTable, BUCKET_SIZE};
use crate::Result;

/// One answer to a `find` query: a peer and the protocol to reach it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindResponse {
    /// 64-hex peer id.
    pub id: String,
    /// `storage-v1` for a holder, `finder-v1` for an overlay hop.
    pub protocol: String,
}

/// Wire payload for `PUT /has/{id}` (protocol token `has-v1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasRequest {
    /// Block addresses the peer holds.
    pub addresses: Vec<String>,
}

/// The location index surface.
#[async_trait]
pub trait Locator: Send + Sync {
    /// This index's own 64-hex id.
    fn id(&self) -> String;
    /// Who has (or who might know about) `address`?
    async fn find(&self, address: &str) -> Result<Vec<FindResponse>>;
    /// Record that storage peer `holder` has the given addresses.
    async fn has(&self, holder: &str, addresses: &[String]) -> Result<()>;
    /// Record that finder `peer` exists.
    async fn notify(&self, peer: &str) -> Result<()>;
}

struct LocatorState {
    routing: RoutingTable,
    // block address -> holder ids, kept sorted for deterministic responses
    known_blocks: HashMap<String, BTreeSet<String>>,
}

/// In-memory location index.
pub struct MemoryLocator {
    id: PeerId,
    state: RwLock<LocatorState>,
}

impl MemoryLocator {
    /// Create an index with the given local id (64-hex).
    pub fn new(id_hex: &str) -> Result<Self> {
        let id = PeerId::parse(id_hex)?;
        Ok(Self {
            id,
            state: RwLock::new(LocatorState {
                routing: RoutingTable::new(id),
                known_blocks: HashMap::new(),
            }),
        })
    }

    /// All known block → holders associations, holders sorted. Drives the
    /// gossip push toward newly discovered finders.
    pub fn snapshot_blocks(&self) -> HashMap<String, Vec<String>> {
        let state = self.state.read().expect("locator lock poisoned");
        state
            .known_blocks
            .iter()
            .map(|(addr, holders)| (addr.clone(), holders.iter().cloned().collect()))
            .collect()
    }

    /// All finder peers currently in the routing table.
    pub fn snapshot_peers(&self) -> Vec<PeerId> {
        let state = self.state.read().expect("locator lock poisoned");
        state.routing.snapshot()
    }
}

#[async_trait]
impl Locator for MemoryLocator {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn find(&self, address: &str) -> Result<Vec<FindResponse>> {
        let state = self.state.read().expect("locator lock poisoned");

        if let Some(holders) = state.known_blocks.get(address) {
            if !holders.is_empty() {
                return Ok(holders
                    .iter()
                    .map(|id| FindResponse {
                        id: id.clone(),
                        protocol: protocol::STORAGE.to_string(),
                    })
                    .collect());
            }
        }

        // Unknown address: hand back the closest finders so the caller can
        // keep walking the overlay.
        let target = PeerId::parse(address)?;
        Ok(state
            .routing
            .closest(&target, BUCKET_SIZE)
            .into_iter()
            .map(|peer| FindResponse {
                id: peer.to_string(),
                protocol: protocol::FINDER.to_string(),
            })
            .collect())
    }

    async fn has(&self, holder: &str, addresses: &[String]) -> Result<()> {
        let mut state = self.state.write().expect("locator lock poisoned");
        for address in addresses {
            state
                .known_blocks
                .entry(address.clone())
                .or_default()
                .insert(holder.to_string());
        }
        Ok(())
    }

    async fn notify(&self, peer: &str) -> Result<()> {
        let peer = PeerId::parse(peer)?;
        let mut state = self.state.write().expect("locator lock poisoned");
        state.routing.add(peer);
        Ok(())
    }
}
