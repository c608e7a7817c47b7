//! axum HTTP surface for a finder, including the gossip push on notify.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use tracing::debug;

use invariant_registry::Discovery;

use crate::client::FinderClient;
use crate::kademlia::PeerId;
use crate::locator::{HasRequest, Locator, MemoryLocator};
use crate::LocatorError;

#[derive(Clone)]
struct FinderState {
    locator: Arc<MemoryLocator>,
    discovery: Option<Arc<dyn Discovery>>,
}

/// Build the finder router: `GET /id`, `GET /{address}`, `PUT /has/{id}`,
/// `PUT /notify/{id}`. When discovery is available, a notify also pushes the
/// locally indexed blocks the new peer is closer to.
pub fn router(locator: Arc<MemoryLocator>, discovery: Option<Arc<dyn Discovery>>) -> Router {
    Router::new()
        .route("/id", get(handle_id))
        .route("/has/{id}", put(handle_has))
        .route("/notify/{id}", put(handle_notify))
        .route("/{address}", get(handle_find))
        .with_state(FinderState { locator, discovery })
}

async fn handle_id(State(state): State<FinderState>) -> impl IntoResponse {
    state.locator.id()
}

async fn handle_find(
    State(state): State<FinderState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    match state.locator.find(&address).await {
        Ok(responses) => Json(responses).into_response(),
        Err(LocatorError::MalformedId(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_has(
    State(state): State<FinderState>,
    Path(holder): Path<String>,
    Json(body): Json<HasRequest>,
) -> impl IntoResponse {
    match state.locator.has(&holder, &body.addresses).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_notify(
    State(state): State<FinderState>,
    Path(peer): Path<String>,
) -> impl IntoResponse {
    if let Err(LocatorError::MalformedId(_)) = state.locator.notify(&peer).await {
        return StatusCode::BAD_REQUEST.into_response();
    }

    // Kademlia push upon discovery: hand the new peer everything it is
    // strictly closer to, off the request path.
    if let Some(discovery) = state.discovery.clone() {
        let locator = Arc::clone(&state.locator);
        tokio::spawn(async move {
            push_closer_blocks(&locator, discovery.as_ref(), &peer).await;
        });
    }

    StatusCode::OK.into_response()
}

/// Send `has(holder, addresses)` to `new_peer` for every indexed address
/// that is strictly closer to it than to this node, grouped by holder.
async fn push_closer_blocks(
    locator: &MemoryLocator,
    discovery: &dyn Discovery,
    new_peer: &str,
) {
    let Some(desc) = discovery.get(new_peer).await else {
        return;
    };
    let (Ok(local), Ok(remote)) = (
        PeerId::parse(&locator.id()),
        PeerId::parse(new_peer),
    ) else {
        return;
    };

    let mut push_map: HashMap<String, Vec<String>> = HashMap::new();
    for (address, holders) in locator.snapshot_blocks() {
        let Ok(block) = PeerId::parse(&address) else {
            continue;
        };
        if remote.closer_to(&local, &block) {
            for holder in holders {
                push_map.entry(holder).or_default().push(address.clone());
            }
        }
    }

    let client = FinderClient::new(&desc.address);
    for (holder, addresses) in push_map {
        if let Err(e) = client.has(&holder, &addresses).await {
            debug!(error = %e, peer = new_peer, "gossip push failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invariant_registry::{MemoryDiscovery, ServiceRegistration};

    fn hex_id(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn find_and_has_over_http() {
        let locator = Arc::new(MemoryLocator::new(&hex_id(0)).unwrap());
        let base = serve(router(locator, None)).await;
        let client = FinderClient::new(&base);

        let addr = hex_id(9);
        client
            .has(&hex_id(5), std::slice::from_ref(&addr))
            .await
            .unwrap();

        let responses = client.find(&addr).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, hex_id(5));
        assert_eq!(responses[0].protocol, "storage-v1");
    }

    #[tokio::test]
    async fn malformed_find_is_bad_request() {
        let locator = Arc::new(MemoryLocator::new(&hex_id(0)).unwrap());
        let base = serve(router(locator, None)).await;
        let resp = reqwest::get(format!("{base}/zz-not-hex")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn notify_pushes_closer_blocks() {
        // Two finders: "far" (0xff…) and "near" (0x01…). A block at 0x03…
        // is closer to near, so far pushes it over on notify.
        let far = Arc::new(MemoryLocator::new(&hex_id(0xff)).unwrap());
        let near = Arc::new(MemoryLocator::new(&hex_id(0x01)).unwrap());

        let discovery = Arc::new(MemoryDiscovery::new());
        let near_base = serve(router(Arc::clone(&near), None)).await;
        discovery
            .register(ServiceRegistration {
                id: near.id(),
                address: near_base,
                protocols: vec!["finder-v1".to_string()],
            })
            .await
            .unwrap();

        let far_base = serve(router(Arc::clone(&far), Some(discovery as Arc<dyn Discovery>))).await;

        let block = hex_id(0x03);
        far.has(&hex_id(0x44), std::slice::from_ref(&block))
            .await
            .unwrap();

        let client = FinderClient::new(&far_base);
        client.notify(&near.id()).await.unwrap();

        // The push happens off the request path.
        for _ in 0..50 {
            if !near.snapshot_blocks().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let blocks = near.snapshot_blocks();
        assert_eq!(blocks.get(&block).cloned(), Some(vec![hex_id(0x44)]));
    }
}
