//! Multi-service flows: discovery, storage peers, finder, replication,
//! and the file tree working together over real HTTP.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use invariant_content::ContentLink;
use invariant_files::{EntryKind, FileTree, FileTreeConfig, ROOT_NODE};
use invariant_locator::{
    HasClient, HasNotifier, HasNotifierConfig, Locator, MemoryLocator,
};
use invariant_registry::{Discovery, MemoryDiscovery, MemorySlots, SlotStore};
use invariant_replicate::{ReplicationConfig, ReplicationController};
use invariant_storage::{
    AggregateClient, AggregateClientConfig, BlobStore, BlockFeed, MemoryStore,
};

use crate::{serve, serve_storage_peer};

#[tokio::test]
async fn tree_written_through_aggregate_is_readable_elsewhere() {
    let discovery = Arc::new(MemoryDiscovery::new());
    let writer_peer = Arc::new(MemoryStore::new());
    let reader_peer = Arc::new(MemoryStore::new());
    serve_storage_peer(Arc::clone(&writer_peer), Some(Arc::clone(&discovery))).await;
    serve_storage_peer(Arc::clone(&reader_peer), Some(Arc::clone(&discovery))).await;

    let slots = Arc::new(MemorySlots::new());

    // Writer: aggregate client over discovery, writable tree.
    let aggregate = Arc::new(AggregateClient::new(
        None,
        Some(Arc::clone(&discovery) as Arc<dyn Discovery>),
        AggregateClientConfig::default(),
    ));
    let tree = FileTree::new(
        Arc::clone(&aggregate) as Arc<dyn BlobStore>,
        Some(Arc::clone(&slots) as Arc<dyn SlotStore>),
        ContentLink::slot("federation-root"),
        FileTreeConfig::default(),
    )
    .await
    .unwrap();

    let docs = tree
        .create_entry(ROOT_NODE, "docs", EntryKind::Directory, "", None, None)
        .await
        .unwrap();
    tree.create_entry(
        docs,
        "hello.txt",
        EntryKind::File,
        "",
        None,
        Some(b"hello federation"),
    )
    .await
    .unwrap();
    tree.sync(ROOT_NODE, true).await.unwrap();

    // The peers report their holdings to a location index; a cold reader
    // only reaches them through it.
    let locator = Arc::new(MemoryLocator::new(&hex::encode([0x0fu8; 32])).unwrap());
    for peer in [&writer_peer, &reader_peer] {
        locator.has(peer.id(), &peer.list()).await.unwrap();
    }

    // Reader: a second aggregate client, fresh live set, same discovery.
    let reader_aggregate = Arc::new(AggregateClient::new(
        Some(Arc::clone(&locator) as Arc<dyn Locator>),
        Some(Arc::clone(&discovery) as Arc<dyn Discovery>),
        AggregateClientConfig::default(),
    ));
    let reader_tree = FileTree::new(
        reader_aggregate as Arc<dyn BlobStore>,
        Some(Arc::clone(&slots) as Arc<dyn SlotStore>),
        ContentLink::slot("federation-root"),
        FileTreeConfig::default(),
    )
    .await
    .unwrap();

    let docs_info = reader_tree.lookup(ROOT_NODE, "docs").await.unwrap();
    let file_info = reader_tree
        .lookup(docs_info.node, "hello.txt")
        .await
        .unwrap();
    assert_eq!(
        reader_tree.read_file(file_info.node, 0, 0).await.unwrap(),
        b"hello federation"
    );
}

#[tokio::test]
async fn finder_learns_holders_through_has_notifications() {
    let discovery = Arc::new(MemoryDiscovery::new());
    let peer = Arc::new(MemoryStore::new());
    serve_storage_peer(Arc::clone(&peer), Some(Arc::clone(&discovery))).await;

    let locator = Arc::new(MemoryLocator::new(&hex::encode([1u8; 32])).unwrap());
    let finder_base = serve(invariant_locator::server::router(
        Arc::clone(&locator),
        None,
    ))
    .await;

    // Wire the peer's new-block feed to the finder with fast batching.
    let _notifier = HasNotifier::start(
        peer.id().to_string(),
        vec![HasClient::new(&finder_base)],
        peer.list(),
        peer.subscribe(),
        HasNotifierConfig {
            batch_size: 100,
            batch_interval: Duration::from_millis(20),
        },
    );

    let address = peer
        .store(Bytes::from_static(b"announce me"))
        .await
        .unwrap();

    // Wait for the batch flush, then resolve through the index.
    let mut responses = Vec::new();
    for _ in 0..100 {
        responses = locator.find(&address).await.unwrap();
        if responses.iter().any(|r| r.protocol == "storage-v1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, peer.id());
    assert_eq!(responses[0].protocol, "storage-v1");

    // An aggregate client with only the finder and discovery can now read
    // the block cold.
    let aggregate = AggregateClient::new(
        Some(Arc::clone(&locator) as Arc<dyn Locator>),
        Some(Arc::clone(&discovery) as Arc<dyn Discovery>),
        AggregateClientConfig::default(),
    );
    assert_eq!(
        aggregate.get(&address).await.unwrap().unwrap(),
        Bytes::from_static(b"announce me")
    );
}

#[tokio::test]
async fn controller_brings_blocks_up_to_factor() {
    let discovery = Arc::new(MemoryDiscovery::new());

    let mut peers = Vec::new();
    for _ in 0..3 {
        let peer = Arc::new(MemoryStore::new());
        serve_storage_peer(Arc::clone(&peer), Some(Arc::clone(&discovery))).await;
        peers.push(peer);
    }

    let block = peers[0]
        .store(Bytes::from_static(b"precious data"))
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
    for peer in &peers {
        controller.register(peer.id());
    }
    controller.has(peers[0].id(), std::slice::from_ref(&block));

    controller.sync().await;

    let mut holders = 0;
    for peer in &peers {
        if peer.has(&block).await.unwrap() {
            holders += 1;
        }
    }
    assert_eq!(holders, 2);
}
