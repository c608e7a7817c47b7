//! In-memory blob store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use invariant_registry::identity;

use crate::store::{address_of, BlobStore, BlockFeed};
use crate::Result;

const FEED_CAPACITY: usize = 4096;

/// Blob store backed by a process-local map, with a fresh id per process.
pub struct MemoryStore {
    id: String,
    blobs: RwLock<HashMap<String, Bytes>>,
    feed: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            id: identity::random_id(),
            blobs: RwLock::new(HashMap::new()),
            feed,
        }
    }

    /// This store's 64-hex id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn insert(&self, address: String, data: Bytes) {
        let mut blobs = self.blobs.write().expect("store lock poisoned");
        if blobs.insert(address.clone(), data).is_none() {
            let _ = self.feed.send(address);
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn has(&self, address: &str) -> Result<bool> {
        let blobs = self.blobs.read().expect("store lock poisoned");
        Ok(blobs.contains_key(address))
    }

    async fn get(&self, address: &str) -> Result<Option<Bytes>> {
        let blobs = self.blobs.read().expect("store lock poisoned");
        Ok(blobs.get(address).cloned())
    }

    async fn store(&self, data: Bytes) -> Result<String> {
        let address = address_of(&data);
        self.insert(address.clone(), data);
        Ok(address)
    }

    async fn store_at(&self, address: &str, data: Bytes) -> Result<bool> {
        if address_of(&data) != address {
            return Ok(false);
        }
        self.insert(address.to_string(), data);
        Ok(true)
    }

    async fn size(&self, address: &str) -> Result<Option<u64>> {
        let blobs = self.blobs.read().expect("store lock poisoned");
        Ok(blobs.get(address).map(|b| b.len() as u64))
    }
}

impl BlockFeed for MemoryStore {
    fn list(&self) -> Vec<String> {
        let blobs = self.blobs.read().expect("store lock poisoned");
        blobs.keys().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_read_back() {
        let store = MemoryStore::new();
        let addr = store.store(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(addr, address_of(b"hello"));
        assert!(store.has(&addr).await.unwrap());
        assert_eq!(
            store.get(&addr).await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(store.size(&addr).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn missing_blob_is_none() {
        let store = MemoryStore::new();
        let addr = address_of(b"missing");
        assert!(!store.has(&addr).await.unwrap());
        assert!(store.get(&addr).await.unwrap().is_none());
        assert!(store.size(&addr).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_at_verifies_digest() {
        let store = MemoryStore::new();
        let good = address_of(b"payload");
        assert!(store
            .store_at(&good, Bytes::from_static(b"payload"))
            .await
            .unwrap());
        assert!(!store
            .store_at(&good, Bytes::from_static(b"tampered"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn restore_is_idempotent_and_silent() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe();
        store.store(Bytes::from_static(b"x")).await.unwrap();
        store.store(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), address_of(b"x"));
        assert!(matches!(
            feed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
