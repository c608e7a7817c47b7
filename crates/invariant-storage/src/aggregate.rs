//! Aggregate storage client: location-aware read failover across live
//! peers, with an LRU memory of where blocks were last seen.
//!
//! Reads walk the LRU-cached holders first, then every live peer, then the
//! location index (materializing newly learned peers through discovery).
//! Writes round-robin across the live set. A transport-level failure or a
//! gateway-class 5xx marks the peer dead: it is dropped from the live set
//! and from every LRU entry.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use invariant_locator::Locator;
use invariant_registry::{protocol, Discovery};

use crate::client::StorageClient;
use crate::store::BlobStore;
use crate::{Result, StorageError};

/// Tuning for the aggregate client.
#[derive(Debug, Clone)]
pub struct AggregateClientConfig {
    /// How many storage peers to materialize from discovery when the live
    /// set is empty.
    pub num_store_servers: usize,
    /// Capacity of the block-location LRU.
    pub max_blocks: usize,
}

impl Default for AggregateClientConfig {
    fn default() -> Self {
        Self {
            num_store_servers: 3,
            max_blocks: 1000,
        }
    }
}

struct LiveSet {
    clients: HashMap<String, StorageClient>,
    // Insertion order, for round-robin writes and ordered read walks.
    ids: Vec<String>,
    counter: u64,
}

/// The aggregate client. Implements [`BlobStore`] so readers and writers
/// can stay oblivious to how many peers are behind it.
///
/// `store` buffers each blob in memory (blobs are bounded by the 2 MiB
/// chunk ceiling), which is what makes retrying on the next peer safe; a
/// non-rewindable stream could only ever be offered to the first peer.
pub struct AggregateClient {
    finder: Option<Arc<dyn Locator>>,
    discovery: Option<Arc<dyn Discovery>>,
    config: AggregateClientConfig,
    live: Mutex<LiveSet>,
    locations: Mutex<LruCache<String, Vec<String>>>,
}

impl AggregateClient {
    /// Create a client over the given location index and discovery
    /// registry; either may be absent, shrinking the read path accordingly.
    pub fn new(
        finder: Option<Arc<dyn Locator>>,
        discovery: Option<Arc<dyn Discovery>>,
        config: AggregateClientConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_blocks.max(1)).expect("max(1) is non-zero");
        Self {
            finder,
            discovery,
            config,
            live: Mutex::new(LiveSet {
                clients: HashMap::new(),
                ids: Vec::new(),
                counter: 0,
            }),
            locations: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Register a live peer directly, bypassing discovery. Mostly for
    /// wiring static peer lists.
    pub fn add_peer(&self, id: &str, base_url: &str) {
        let mut live = self.live.lock().expect("live set lock poisoned");
        if !live.clients.contains_key(id) {
            live.clients
                .insert(id.to_string(), StorageClient::new(base_url));
            live.ids.push(id.to_string());
        }
    }

    /// Ids of the currently live peers, in round-robin order.
    pub fn live_ids(&self) -> Vec<String> {
        let live = self.live.lock().expect("live set lock poisoned");
        live.ids.clone()
    }

    /// The LRU-cached holders of `address`, most confident first. Empty if
    /// the address fell out of the cache.
    pub fn servers_for_block(&self, address: &str) -> Vec<String> {
        let mut locations = self.locations.lock().expect("lru lock poisoned");
        locations.get(address).cloned().unwrap_or_default()
    }

    fn remove_peer(&self, id: &str) {
        debug!(peer = id, "evicting dead storage peer");
        {
            let mut live = self.live.lock().expect("live set lock poisoned");
            live.clients.remove(id);
            live.ids.retain(|existing| existing != id);
        }
        let mut locations = self.locations.lock().expect("lru lock poisoned");
        for (_, holders) in locations.iter_mut() {
            holders.retain(|existing| existing != id);
        }
    }

    fn client_for(&self, id: &str) -> Option<StorageClient> {
        let live = self.live.lock().expect("live set lock poisoned");
        live.clients.get(id).cloned()
    }

    fn mark_block_used(&self, address: &str, holders: &[String]) {
        if holders.is_empty() {
            return;
        }
        let mut locations = self.locations.lock().expect("lru lock poisoned");
        if let Some(existing) = locations.get_mut(address) {
            for holder in holders {
                if !existing.contains(holder) {
                    existing.push(holder.clone());
                }
            }
            return;
        }
        locations.put(address.to_string(), holders.to_vec());
    }

    async fn materialize_peer(&self, id: &str) -> Option<StorageClient> {
        if let Some(existing) = self.client_for(id) {
            return Some(existing);
        }
        let discovery = self.discovery.as_ref()?;
        let desc = discovery.get(id).await?;
        self.add_peer(id, &desc.address);
        self.client_for(id)
    }

    /// Query discovery for storage peers when the live set is empty.
    async fn ensure_live_peers(&self) -> Result<()> {
        if !self.live_ids().is_empty() {
            return Ok(());
        }
        let Some(discovery) = self.discovery.as_ref() else {
            return Err(StorageError::Unavailable);
        };
        let services = discovery
            .find(protocol::STORAGE, self.config.num_store_servers)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        for service in services {
            self.add_peer(&service.id, &service.address);
        }
        if self.live_ids().is_empty() {
            return Err(StorageError::Unavailable);
        }
        Ok(())
    }

    /// The LRU → live set → location index read walk. `op` answers
    /// `Ok(Some(v))` on success and `Ok(None)` when this peer cannot serve
    /// the address.
    async fn read_operation<T, F, Fut>(&self, address: &str, op: F) -> Result<Option<T>>
    where
        F: Fn(StorageClient) -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>>,
    {
        // 1. Peers the LRU remembers for this address.
        for id in self.servers_for_block(address) {
            let Some(client) = self.client_for(&id) else {
                continue;
            };
            match op(client).await {
                Ok(Some(value)) => {
                    self.mark_block_used(address, std::slice::from_ref(&id));
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(StorageError::Transient(_)) => self.remove_peer(&id),
                Err(_) => {}
            }
        }

        // 2. Every live peer, in declared order.
        for id in self.live_ids() {
            let Some(client) = self.client_for(&id) else {
                continue;
            };
            match op(client).await {
                Ok(Some(value)) => {
                    self.mark_block_used(address, std::slice::from_ref(&id));
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(StorageError::Transient(_)) => self.remove_peer(&id),
                Err(_) => {}
            }
        }

        // 3. Ask the location index, materializing holders on demand.
        if let Some(finder) = self.finder.as_ref() {
            if let Ok(responses) = finder.find(address).await {
                let mut successful: Vec<String> = Vec::new();
                let mut value = None;
                for response in responses {
                    if response.protocol != protocol::STORAGE {
                        continue;
                    }
                    let Some(client) = self.materialize_peer(&response.id).await else {
                        continue;
                    };
                    if value.is_none() {
                        match op(client).await {
                            Ok(Some(found)) => {
                                successful.push(response.id);
                                value = Some(found);
                            }
                            Ok(None) => {}
                            Err(StorageError::Transient(_)) => self.remove_peer(&response.id),
                            Err(_) => {}
                        }
                    }
                }
                if let Some(value) = value {
                    self.mark_block_used(address, &successful);
                    return Ok(Some(value));
                }
            }
        }

        Ok(None)
    }

    /// Round-robin write walk. Any failure evicts the peer and moves on.
    async fn write_operation<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(StorageClient) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.ensure_live_peers().await?;

        let (ids, start) = {
            let mut live = self.live.lock().expect("live set lock poisoned");
            live.counter = live.counter.wrapping_add(1);
            (live.ids.clone(), live.counter as usize)
        };

        for offset in 0..ids.len() {
            let id = &ids[(start + offset) % ids.len()];
            let Some(client) = self.client_for(id) else {
                continue;
            };
            match op(client).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(peer = %id, error = %e, "write failed, evicting peer");
                    self.remove_peer(id);
                }
            }
        }

        Err(StorageError::Unavailable)
    }
}

#[async_trait::async_trait]
impl BlobStore for AggregateClient {
    async fn has(&self, address: &str) -> Result<bool> {
        let found = self
            .read_operation(address, |client| {
                let address = address.to_string();
                async move {
                    match client.has(&address).await {
                        Ok(true) => Ok(Some(())),
                        Ok(false) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;
        Ok(found.is_some())
    }

    async fn get(&self, address: &str) -> Result<Option<Bytes>> {
        self.read_operation(address, |client| {
            let address = address.to_string();
            async move { client.get(&address).await }
        })
        .await
    }

    async fn store(&self, data: Bytes) -> Result<String> {
        self.write_operation(|client| {
            let data = data.clone();
            async move { client.store(data).await }
        })
        .await
    }

    async fn store_at(&self, address: &str, data: Bytes) -> Result<bool> {
        self.write_operation(|client| {
            let address = address.to_string();
            let data = data.clone();
            async move { client.store_at(&address, data).await }
        })
        .await
    }

    async fn size(&self, address: &str) -> Result<Option<u64>> {
        self.read_operation(address, |client| {
            let address = address.to_string();
            async move { client.size(&address).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::server;
    use crate::store::address_of;
    use invariant_registry::{MemoryDiscovery, ServiceRegistration};

    async fn serve_peer(store: Arc<MemoryStore>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server::router(store.id().to_string(), store, None);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn lru_capacity_evicts_oldest() {
        let client = AggregateClient::new(
            None,
            None,
            AggregateClientConfig {
                num_store_servers: 3,
                max_blocks: 2,
            },
        );
        client.mark_block_used("addr1", &["p1".to_string()]);
        client.mark_block_used("addr2", &["p1".to_string()]);
        client.mark_block_used("addr3", &["p1".to_string()]);

        assert!(client.servers_for_block("addr1").is_empty());
        assert_eq!(client.servers_for_block("addr2"), vec!["p1".to_string()]);
        assert_eq!(client.servers_for_block("addr3"), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn mark_block_used_merges_holders() {
        let client = AggregateClient::new(None, None, AggregateClientConfig::default());
        client.mark_block_used("addr", &["p1".to_string()]);
        client.mark_block_used("addr", &["p2".to_string(), "p1".to_string()]);
        assert_eq!(
            client.servers_for_block("addr"),
            vec!["p1".to_string(), "p2".to_string()]
        );
    }

    #[tokio::test]
    async fn reads_fail_over_across_peers() {
        let holder = Arc::new(MemoryStore::new());
        let empty = Arc::new(MemoryStore::new());
        let holder_base = serve_peer(Arc::clone(&holder)).await;
        let empty_base = serve_peer(Arc::clone(&empty)).await;

        let addr = holder
            .store(Bytes::from_static(b"block data"))
            .await
            .unwrap();

        let client = AggregateClient::new(None, None, AggregateClientConfig::default());
        client.add_peer(empty.id(), &empty_base);
        client.add_peer(holder.id(), &holder_base);

        assert_eq!(
            client.get(&addr).await.unwrap().unwrap(),
            Bytes::from_static(b"block data")
        );
        // The hit is now cached for this address.
        assert_eq!(
            client.servers_for_block(&addr),
            vec![holder.id().to_string()]
        );
        assert!(client.has(&addr).await.unwrap());
        assert_eq!(client.size(&addr).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn dead_peer_is_evicted_and_write_fails_over() {
        let alive = Arc::new(MemoryStore::new());
        let alive_base = serve_peer(Arc::clone(&alive)).await;

        // A listener that is immediately dropped: connecting fails.
        let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_base = format!("http://{}", dead_listener.local_addr().unwrap());
        drop(dead_listener);

        let client = AggregateClient::new(None, None, AggregateClientConfig::default());
        client.add_peer("dead-peer", &dead_base);
        client.add_peer(alive.id(), &alive_base);

        let addr = client.store(Bytes::from_static(b"failover")).await.unwrap();
        assert_eq!(addr, address_of(b"failover"));
        assert!(alive.has(&addr).await.unwrap());
        assert_eq!(client.live_ids(), vec![alive.id().to_string()]);
    }

    #[tokio::test]
    async fn empty_live_set_refills_from_discovery() {
        let peer = Arc::new(MemoryStore::new());
        let peer_base = serve_peer(Arc::clone(&peer)).await;

        let discovery = Arc::new(MemoryDiscovery::new());
        discovery
            .register(ServiceRegistration {
                id: peer.id().to_string(),
                address: peer_base,
                protocols: vec!["storage-v1".to_string()],
            })
            .await
            .unwrap();

        let client = AggregateClient::new(
            None,
            Some(discovery as Arc<dyn Discovery>),
            AggregateClientConfig::default(),
        );
        let addr = client
            .store(Bytes::from_static(b"via discovery"))
            .await
            .unwrap();
        assert!(peer.has(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn no_peers_no_discovery_is_unavailable() {
        let client = AggregateClient::new(None, None, AggregateClientConfig::default());
        assert!(matches!(
            client.store(Bytes::from_static(b"x")).await,
            Err(StorageError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn finder_locates_unknown_blocks() {
        use invariant_locator::MemoryLocator;

        let holder = Arc::new(MemoryStore::new());
        let holder_base = serve_peer(Arc::clone(&holder)).await;
        let addr = holder
            .store(Bytes::from_static(b"found via index"))
            .await
            .unwrap();

        let discovery = Arc::new(MemoryDiscovery::new());
        discovery
            .register(ServiceRegistration {
                id: holder.id().to_string(),
                address: holder_base,
                protocols: vec!["storage-v1".to_string()],
            })
            .await
            .unwrap();

        let locator = Arc::new(MemoryLocator::new(&hex::encode([0u8; 32])).unwrap());
        locator
            .has(holder.id(), std::slice::from_ref(&addr))
            .await
            .unwrap();

        let client = AggregateClient::new(
            Some(locator as Arc<dyn Locator>),
            Some(discovery as Arc<dyn Discovery>),
            AggregateClientConfig::default(),
        );
        assert_eq!(
            client.get(&addr).await.unwrap().unwrap(),
            Bytes::from_static(b"found via index")
        );
        // The responding holder landed in the LRU.
        assert_eq!(
            client.servers_for_block(&addr),
            vec![holder.id().to_string()]
        );
    }
}
