//! Durability across restarts: slot and name registries over the durable
//! map, exercised through their HTTP surfaces.

#![cfg(test)]

use std::sync::Arc;

use invariant_durable::DurableMapConfig;
use invariant_registry::{
    slots_server, NameStore, PersistentNames, PersistentSlots, RegistryError, SlotStore,
    SlotsClient,
};

use crate::serve;

fn no_snapshots() -> DurableMapConfig {
    DurableMapConfig {
        snapshot_interval: None,
    }
}

#[tokio::test]
async fn slots_survive_server_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let first_id = {
        let slots = Arc::new(PersistentSlots::open(dir.path(), no_snapshots()).unwrap());
        let base = serve(slots_server::router(Arc::clone(&slots) as Arc<dyn SlotStore>)).await;
        let client = SlotsClient::new(&base);
        client.create("root", &"aa".repeat(32)).await.unwrap();
        client
            .update("root", &"bb".repeat(32), &"aa".repeat(32))
            .await
            .unwrap();
        slots.id()
    };

    // "Restart": reopen the same directory behind a new server.
    let slots = Arc::new(PersistentSlots::open(dir.path(), no_snapshots()).unwrap());
    assert_eq!(slots.id(), first_id);
    let base = serve(slots_server::router(Arc::clone(&slots) as Arc<dyn SlotStore>)).await;
    let client = SlotsClient::new(&base);
    assert_eq!(client.get("root").await.unwrap(), "bb".repeat(32));

    // The CAS history carried over: the stale previous value conflicts.
    assert!(matches!(
        client
            .update("root", &"cc".repeat(32), &"aa".repeat(32))
            .await,
        Err(RegistryError::PreconditionFailed(_))
    ));
}

#[tokio::test]
async fn rotation_before_restart_loses_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let slots = PersistentSlots::open(dir.path(), no_snapshots()).unwrap();
        slots.create("a", "1").await.unwrap();
        slots.update("a", "2", "1").await.unwrap();
        slots.create("b", "9").await.unwrap();
    }

    // Reopen, rotate the snapshot, mutate more, reopen again.
    {
        let slots = PersistentSlots::open(dir.path(), no_snapshots()).unwrap();
        slots.rotate_snapshot().unwrap();
        slots.create("c", "3").await.unwrap();
    }
    let slots = PersistentSlots::open(dir.path(), no_snapshots()).unwrap();
    assert_eq!(slots.get("a").await.unwrap(), "2");
    assert_eq!(slots.get("b").await.unwrap(), "9");
    assert_eq!(slots.get("c").await.unwrap(), "3");
    assert_eq!(slots.list().len(), 3);
}

#[tokio::test]
async fn names_survive_restart_with_tokens() {
    let dir = tempfile::TempDir::new().unwrap();
    let tokens = vec!["storage-v1".to_string(), "finder-v1".to_string()];
    {
        let names = PersistentNames::open(dir.path(), no_snapshots()).unwrap();
        names.put("cluster-a", &"ab".repeat(32), &tokens).await.unwrap();
    }
    let names = PersistentNames::open(dir.path(), no_snapshots()).unwrap();
    let entry = names.get("cluster-a").await.unwrap();
    assert_eq!(entry.value, "ab".repeat(32));
    assert_eq!(entry.tokens, tokens);
}
