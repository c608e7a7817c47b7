//! Slot registry: mutable (id → address) cells updated by compare-and-swap.
//!
//! A slot is the only mutable object in the system; a writable file tree
//! publishes each new root by CAS-ing its slot from the previously observed
//! address to the new one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use invariant_durable::{DurableMap, DurableMapConfig};

use crate::{identity, RegistryError, Result};

/// Wire payload for a CAS update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotUpdate {
    /// The new address.
    pub address: String,
    /// The address the caller last observed.
    #[serde(rename = "previousAddress")]
    pub previous_address: String,
}

/// Wire payload for slot creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRegistration {
    /// The initial address.
    pub address: String,
}

/// The slot registry surface.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// The registry's own 64-hex id.
    fn id(&self) -> String;
    /// Current address of a slot.
    async fn get(&self, slot: &str) -> Result<String>;
    /// Create a new slot; fails with `Conflict` if it exists.
    async fn create(&self, slot: &str, address: &str) -> Result<()>;
    /// CAS the slot from `previous_address` to `address`.
    async fn update(&self, slot: &str, address: &str, previous_address: &str) -> Result<()>;
}

const FEED_CAPACITY: usize = 1024;

/// In-process slot registry with a fresh id per process.
pub struct MemorySlots {
    id: String,
    store: RwLock<HashMap<String, String>>,
    feed: broadcast::Sender<String>,
}

impl Default for MemorySlots {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySlots {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            id: identity::random_id(),
            store: RwLock::new(HashMap::new()),
            feed,
        }
    }

    /// All slot ids currently present.
    pub fn list(&self) -> Vec<String> {
        let store = self.store.read().expect("slots lock poisoned");
        store.keys().cloned().collect()
    }

    /// Subscribe to ids of newly created or updated slots. Slow consumers
    /// lose entries; the feed is advisory.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }
}

#[async_trait]
impl SlotStore for MemorySlots {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn get(&self, slot: &str) -> Result<String> {
        let store = self.store.read().expect("slots lock poisoned");
        store
            .get(slot)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(slot.to_string()))
    }

    async fn create(&self, slot: &str, address: &str) -> Result<()> {
        let mut store = self.store.write().expect("slots lock poisoned");
        if store.contains_key(slot) {
            return Err(RegistryError::Conflict(slot.to_string()));
        }
        store.insert(slot.to_string(), address.to_string());
        let _ = self.feed.send(slot.to_string());
        Ok(())
    }

    async fn update(&self, slot: &str, address: &str, previous_address: &str) -> Result<()> {
        let mut store = self.store.write().expect("slots lock poisoned");
        let current = store
            .get(slot)
            .ok_or_else(|| RegistryError::NotFound(slot.to_string()))?;
        if current != previous_address {
            return Err(RegistryError::PreconditionFailed(slot.to_string()));
        }
        store.insert(slot.to_string(), address.to_string());
        let _ = self.feed.send(slot.to_string());
        Ok(())
    }
}

/// Disk-backed slot registry on top of the durable map.
pub struct PersistentSlots {
    map: DurableMap,
    feed: broadcast::Sender<String>,
}

impl PersistentSlots {
    /// Open (or initialize) the registry stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: DurableMapConfig) -> Result<Self> {
        let map = DurableMap::open(dir, config)?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self { map, feed })
    }

    /// All slot ids currently present.
    pub fn list(&self) -> Vec<String> {
        self.map.entries().into_keys().collect()
    }

    /// Subscribe to ids of newly created or updated slots.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }

    /// Collapse the journal history into the snapshot file now.
    pub fn rotate_snapshot(&self) -> Result<()> {
        Ok(self.map.rotate_snapshot()?)
    }
}

#[async_trait]
impl SlotStore for PersistentSlots {
    fn id(&self) -> String {
        self.map.id().to_string()
    }

    async fn get(&self, slot: &str) -> Result<String> {
        Ok(self.map.get(slot)?)
    }

    async fn create(&self, slot: &str, address: &str) -> Result<()> {
        self.map.create(slot, address)?;
        let _ = self.feed.send(slot.to_string());
        Ok(())
    }

    async fn update(&self, slot: &str, address: &str, previous_address: &str) -> Result<()> {
        self.map.update(slot, address, previous_address)?;
        let _ = self.feed.send(slot.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_update_cycle() {
        let slots = MemorySlots::new();
        slots.create("slot1", "addr0").await.unwrap();
        assert_eq!(slots.get("slot1").await.unwrap(), "addr0");

        slots.update("slot1", "addr1", "addr0").await.unwrap();
        assert_eq!(slots.get("slot1").await.unwrap(), "addr1");
    }

    #[tokio::test]
    async fn cas_conflicts_are_reported() {
        let slots = MemorySlots::new();
        slots.create("slot1", "addr0").await.unwrap();

        assert!(matches!(
            slots.create("slot1", "other").await,
            Err(RegistryError::Conflict(_))
        ));
        assert!(matches!(
            slots.update("slot1", "addr1", "stale").await,
            Err(RegistryError::PreconditionFailed(_))
        ));
        assert!(matches!(
            slots.update("missing", "a", "b").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn feed_reports_touched_slots() {
        let slots = MemorySlots::new();
        let mut feed = slots.subscribe();
        slots.create("slot1", "addr0").await.unwrap();
        slots.update("slot1", "addr1", "addr0").await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), "slot1");
        assert_eq!(feed.recv().await.unwrap(), "slot1");
    }

    #[tokio::test]
    async fn persistent_slots_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DurableMapConfig {
            snapshot_interval: None,
        };
        {
            let slots = PersistentSlots::open(dir.path(), config.clone()).unwrap();
            slots.create("slot1", "addr0").await.unwrap();
        }
        let slots = PersistentSlots::open(dir.path(), config).unwrap();
        assert_eq!(slots.get("slot1").await.unwrap(), "addr0");
        assert_eq!(slots.list(), vec!["slot1".to_string()]);
    }
}
