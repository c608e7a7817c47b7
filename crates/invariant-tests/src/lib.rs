//! Integration tests spanning the invariant crates.
//!
//! Unit coverage lives next to each module; this crate exercises the
//! seams: codec option matrices over real stores, corruption detection
//! through the whole blob tree, multi-service federation flows, and
//! durability across process-style restarts.

pub mod codec_matrix;
pub mod durability;
pub mod federation;

use std::sync::Arc;

use invariant_registry::{Discovery, MemoryDiscovery, ServiceRegistration};
use invariant_storage::MemoryStore;

/// Serve an axum router on an ephemeral port, returning its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Spin up an in-memory storage peer (with fetch support when discovery is
/// given), register it, and return its base URL.
pub async fn serve_storage_peer(
    store: Arc<MemoryStore>,
    discovery: Option<Arc<MemoryDiscovery>>,
) -> String {
    let router = invariant_storage::server::router(
        store.id().to_string(),
        Arc::clone(&store) as Arc<dyn invariant_storage::BlobStore>,
        discovery
            .clone()
            .map(|d| d as Arc<dyn Discovery>),
    );
    let base = serve(router).await;
    if let Some(discovery) = discovery {
        discovery
            .register(ServiceRegistration {
                id: store.id().to_string(),
                address: base.clone(),
                protocols: vec!["storage-v1".to_string()],
            })
            .await
            .unwrap();
    }
    base
}
