//! The replication controller and its sync pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use invariant_locator::kademlia::cmp_distance;
use invariant_locator::PeerId;
use invariant_registry::Discovery;
use invariant_storage::{BlobStore, StorageClient};

/// Tuning for the controller.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Target number of distinct holders per block.
    pub replication_factor: usize,
    /// Consecutive failed transfers before a destination is evicted.
    pub max_failures: u32,
    /// Period between sync passes when the timer is started.
    pub sync_period: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            max_failures: 3,
            sync_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct PeerState {
    blocks: BTreeSet<String>,
    failures: u32,
    cached_address: Option<String>,
}

/// Tracks registered storage peers and replicates under-held blocks toward
/// the configured factor. One sync pass runs at a time per controller; the
/// timer re-enters it on the configured period.
pub struct ReplicationController {
    discovery: Option<Arc<dyn Discovery>>,
    config: ReplicationConfig,
    peers: RwLock<HashMap<String, PeerState>>,
    // Serializes sync passes without blocking has/register updates.
    sync_gate: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationController {
    /// Create a controller. Without discovery, peers whose address was
    /// never cached cannot be reached and are skipped during sync.
    pub fn new(discovery: Option<Arc<dyn Discovery>>, config: ReplicationConfig) -> Self {
        Self {
            discovery,
            config,
            peers: RwLock::new(HashMap::new()),
            sync_gate: tokio::sync::Mutex::new(()),
            timer: Mutex::new(None),
        }
    }

    /// Register a storage peer. Idempotent; an existing peer keeps its
    /// block set and failure count.
    pub fn register(&self, id: &str) {
        let mut peers = self.peers.write().expect("controller lock poisoned");
        peers.entry(id.to_string()).or_default();
    }

    /// Record that `id` holds the given block addresses. Unregistered ids
    /// are registered implicitly.
    pub fn has(&self, id: &str, addresses: &[String]) {
        let mut peers = self.peers.write().expect("controller lock poisoned");
        let state = peers.entry(id.to_string()).or_default();
        for address in addresses {
            state.blocks.insert(address.clone());
        }
    }

    /// Ids of all registered peers.
    pub fn registered_ids(&self) -> Vec<String> {
        let peers = self.peers.read().expect("controller lock poisoned");
        peers.keys().cloned().collect()
    }

    /// The blocks a peer is known to hold.
    pub fn blocks_of(&self, id: &str) -> Vec<String> {
        let peers = self.peers.read().expect("controller lock poisoned");
        peers
            .get(id)
            .map(|state| state.blocks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The consecutive-failure count of a peer, if registered.
    pub fn failures_of(&self, id: &str) -> Option<u32> {
        let peers = self.peers.read().expect("controller lock poisoned");
        peers.get(id).map(|state| state.failures)
    }

    /// Start the periodic sync timer. The controller keeps running until
    /// [`stop`](Self::stop) or drop.
    pub fn start(self: Arc<Self>) {
        let controller = Arc::clone(&self);
        let period = self.config.sync_period;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.sync().await;
            }
        });
        let mut timer = self.timer.lock().expect("timer lock poisoned");
        if let Some(old) = timer.replace(task) {
            old.abort();
        }
    }

    /// Stop the periodic sync timer.
    pub fn stop(&self) {
        let mut timer = self.timer.lock().expect("timer lock poisoned");
        if let Some(task) = timer.take() {
            task.abort();
        }
    }

    /// One synchronization pass: find blocks below the replication factor
    /// and command the closest non-holders to obtain them.
    pub async fn sync(&self) {
        let _pass = self.sync_gate.lock().await;

        let snapshot: HashMap<String, BTreeSet<String>> = {
            let peers = self.peers.read().expect("controller lock poisoned");
            peers
                .iter()
                .map(|(id, state)| (id.clone(), state.blocks.clone()))
                .collect()
        };

        // block -> holders, holders sorted so the source choice is stable.
        let mut block_holders: HashMap<String, Vec<String>> = HashMap::new();
        for (id, blocks) in &snapshot {
            for block in blocks {
                block_holders.entry(block.clone()).or_default().push(id.clone());
            }
        }
        for holders in block_holders.values_mut() {
            holders.sort();
        }

        for (block, holders) in block_holders {
            if holders.len() >= self.config.replication_factor {
                continue;
            }
            let Ok(block_id) = PeerId::parse(&block) else {
                debug!(block = %block, "skipping malformed block address");
                continue;
            };
            self.replicate_block(&block, &block_id, &holders, &snapshot)
                .await;
        }
    }

    async fn replicate_block(
        &self,
        block: &str,
        block_id: &PeerId,
        holders: &[String],
        snapshot: &HashMap<String, BTreeSet<String>>,
    ) {
        let source_id = match holders.first() {
            Some(id) => id.clone(),
            None => return,
        };
        let Some(source_address) = self.resolve_address(&source_id).await else {
            debug!(peer = %source_id, "source address unresolvable, skipping block");
            return;
        };

        // Rank every registered peer by XOR distance to the block; ties
        // fall back to the byte compare of the distances.
        let mut ranked: Vec<(String, [u8; 32])> = snapshot
            .keys()
            .filter_map(|id| {
                let peer = PeerId::parse(id).ok()?;
                Some((id.clone(), peer.distance(block_id)))
            })
            .collect();
        ranked.sort_by(|a, b| cmp_distance(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));

        let mut needed = self.config.replication_factor - holders.len();
        for (dest_id, _) in ranked {
            if needed == 0 {
                break;
            }
            if holders.contains(&dest_id) {
                continue;
            }
            let Some(dest_address) = self.resolve_address(&dest_id).await else {
                continue;
            };

            if self
                .transfer(block, &source_id, &source_address, &dest_id, &dest_address)
                .await
            {
                needed -= 1;
                self.record_success(&dest_id, block);
            } else {
                self.record_failure(&dest_id);
            }
        }
    }

    /// Up to two attempts per destination: ask it to fetch from the source,
    /// then fall back to relaying the bytes through the controller.
    async fn transfer(
        &self,
        block: &str,
        source_id: &str,
        source_address: &str,
        dest_id: &str,
        dest_address: &str,
    ) -> bool {
        let dest = StorageClient::new(dest_address);

        match dest.fetch(block, source_id).await {
            Ok(()) => {
                info!(block = %block, dest = %dest_id, "replicated via fetch");
                return true;
            }
            Err(e) => {
                debug!(block = %block, dest = %dest_id, error = %e, "fetch failed, relaying");
            }
        }

        let source = StorageClient::new(source_address);
        match source.get(block).await {
            Ok(Some(data)) => match dest.store_at(block, data).await {
                Ok(true) => {
                    info!(block = %block, dest = %dest_id, "replicated via relay");
                    true
                }
                Ok(false) => {
                    warn!(block = %block, dest = %dest_id, "relay rejected: digest mismatch");
                    false
                }
                Err(e) => {
                    warn!(block = %block, dest = %dest_id, error = %e, "relay store failed");
                    false
                }
            },
            Ok(None) => {
                warn!(block = %block, source = %source_id, "source no longer has block");
                false
            }
            Err(e) => {
                warn!(block = %block, source = %source_id, error = %e, "relay read failed");
                false
            }
        }
    }

    async fn resolve_address(&self, id: &str) -> Option<String> {
        {
            let peers = self.peers.read().expect("controller lock poisoned");
            if let Some(cached) = peers.get(id).and_then(|s| s.cached_address.clone()) {
                return Some(cached);
            }
        }
        let desc = self.discovery.as_ref()?.get(id).await?;
        let mut peers = self.peers.write().expect("controller lock poisoned");
        if let Some(state) = peers.get_mut(id) {
            state.cached_address = Some(desc.address.clone());
        }
        Some(desc.address)
    }

    fn record_success(&self, dest_id: &str, block: &str) {
        let mut peers = self.peers.write().expect("controller lock poisoned");
        if let Some(state) = peers.get_mut(dest_id) {
            state.failures = 0;
            state.blocks.insert(block.to_string());
        }
    }

    fn record_failure(&self, dest_id: &str) {
        let mut peers = self.peers.write().expect("controller lock poisoned");
        let Some(state) = peers.get_mut(dest_id) else {
            return;
        };
        state.failures += 1;
        if state.failures >= self.config.max_failures {
            warn!(peer = %dest_id, failures = state.failures, "evicting failing peer");
            peers.remove(dest_id);
        }
    }
}

impl Drop for ReplicationController {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(task) = timer.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use invariant_registry::{MemoryDiscovery, ServiceRegistration};
    use invariant_storage::{server as storage_server, BlobStore, MemoryStore};

    fn hex_id(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    async fn serve_peer(store: Arc<MemoryStore>, discovery: Arc<MemoryDiscovery>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = storage_server::router(
            store.id().to_string(),
            store,
            Some(discovery as Arc<dyn Discovery>),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn register_peer(
        discovery: &MemoryDiscovery,
        id: &str,
        address: &str,
    ) {
        discovery
            .register(ServiceRegistration {
                id: id.to_string(),
                address: address.to_string(),
                protocols: vec!["storage-v1".to_string()],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_replicates_to_closest_non_holders() {
        let discovery = Arc::new(MemoryDiscovery::new());

        // Four peers; the block lives on one of them.
        let mut stores = Vec::new();
        for _ in 0..4 {
            let store = Arc::new(MemoryStore::new());
            let base = serve_peer(Arc::clone(&store), Arc::clone(&discovery)).await;
            register_peer(&discovery, store.id(), &base).await;
            stores.push(store);
        }

        let block = stores[0]
            .store(Bytes::from_static(b"replicate this block"))
            .await
            .unwrap();

        let controller = ReplicationController::new(
            Some(Arc::clone(&discovery) as Arc<dyn Discovery>),
            ReplicationConfig::default(),
        );
        for store in &stores {
            controller.register(store.id());
        }
        controller.has(stores[0].id(), std::slice::from_ref(&block));

        controller.sync().await;

        // Exactly replication_factor peers hold the block now: the original
        // holder plus the two XOR-closest non-holders.
        let block_id = PeerId::parse(&block).unwrap();
        let mut non_holders: Vec<&Arc<MemoryStore>> = stores[1..].iter().collect();
        non_holders.sort_by(|a, b| {
            let da = PeerId::parse(a.id()).unwrap().distance(&block_id);
            let db = PeerId::parse(b.id()).unwrap().distance(&block_id);
            cmp_distance(&da, &db)
        });

        assert!(stores[0].has(&block).await.unwrap());
        assert!(non_holders[0].has(&block).await.unwrap());
        assert!(non_holders[1].has(&block).await.unwrap());
        assert!(!non_holders[2].has(&block).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_failures_evict_the_destination() {
        let discovery = Arc::new(MemoryDiscovery::new());

        // The holder is reachable; the destination address goes nowhere.
        let holder = Arc::new(MemoryStore::new());
        let holder_base = serve_peer(Arc::clone(&holder), Arc::clone(&discovery)).await;
        register_peer(&discovery, holder.id(), &holder_base).await;

        let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_base = format!("http://{}", dead_listener.local_addr().unwrap());
        drop(dead_listener);
        let dead_id = hex_id(0x77);
        register_peer(&discovery, &dead_id, &dead_base).await;

        let block = holder
            .store(Bytes::from_static(b"unreachable destination"))
            .await
            .unwrap();

        let controller = ReplicationController::new(
            Some(Arc::clone(&discovery) as Arc<dyn Discovery>),
            ReplicationConfig {
                replication_factor: 2,
                max_failures: 3,
                sync_period: Duration::from_secs(60),
            },
        );
        controller.register(holder.id());
        controller.register(&dead_id);
        controller.has(holder.id(), std::slice::from_ref(&block));

        controller.sync().await;
        assert_eq!(controller.failures_of(&dead_id), Some(1));
        controller.sync().await;
        assert_eq!(controller.failures_of(&dead_id), Some(2));
        controller.sync().await;
        // Third strike: evicted from the registry.
        assert_eq!(controller.failures_of(&dead_id), None);
        assert_eq!(controller.registered_ids(), vec![holder.id().to_string()]);
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let discovery = Arc::new(MemoryDiscovery::new());

        let holder = Arc::new(MemoryStore::new());
        let holder_base = serve_peer(Arc::clone(&holder), Arc::clone(&discovery)).await;
        register_peer(&discovery, holder.id(), &holder_base).await;

        let dest = Arc::new(MemoryStore::new());
        let dest_base = serve_peer(Arc::clone(&dest), Arc::clone(&discovery)).await;
        register_peer(&discovery, dest.id(), &dest_base).await;

        let block = holder
            .store(Bytes::from_static(b"eventually works"))
            .await
            .unwrap();

        let controller = ReplicationController::new(
            Some(Arc::clone(&discovery) as Arc<dyn Discovery>),
            ReplicationConfig {
                replication_factor: 2,
                max_failures: 3,
                sync_period: Duration::from_secs(60),
            },
        );
        controller.register(holder.id());
        controller.register(dest.id());
        controller.has(holder.id(), std::slice::from_ref(&block));

        // Seed a prior failure, then let a pass succeed.
        controller.record_failure(dest.id());
        assert_eq!(controller.failures_of(dest.id()), Some(1));

        controller.sync().await;
        assert!(dest.has(&block).await.unwrap());
        assert_eq!(controller.failures_of(dest.id()), Some(0));
    }

    #[tokio::test]
    async fn malformed_addresses_are_skipped() {
        let controller = ReplicationController::new(None, ReplicationConfig::default());
        controller.register(&hex_id(1));
        controller.has(&hex_id(1), &["not-a-real-address".to_string()]);
        // Must not panic or loop; the malformed entry is simply ignored.
        controller.sync().await;
    }
}
