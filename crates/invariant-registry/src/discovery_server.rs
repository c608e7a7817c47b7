//! axum HTTP surface for a discovery registry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::discovery::{Discovery, ServiceRegistration};
use crate::identity;

#[derive(Clone)]
struct DiscoveryState {
    id: String,
    discovery: Arc<dyn Discovery>,
}

/// Build the discovery router: `GET /id`, `GET /{id}`, `GET /?protocol=&count=`,
/// `PUT /{id}`.
pub fn router(discovery: Arc<dyn Discovery>) -> Router {
    let state = DiscoveryState {
        id: identity::random_id(),
        discovery,
    };
    Router::new()
        .route("/", get(handle_find))
        .route("/id", get(handle_id))
        .route("/{id}", get(handle_get).put(handle_register))
        .with_state(state)
}

async fn handle_id(State(state): State<DiscoveryState>) -> impl IntoResponse {
    state.id.clone()
}

async fn handle_get(
    State(state): State<DiscoveryState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.discovery.get(&id).await {
        Some(desc) => Json(desc).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_find(
    State(state): State<DiscoveryState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let protocol = match params.get("protocol") {
        Some(p) if !p.is_empty() => p.clone(),
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };
    let count = params
        .get("count")
        .and_then(|c| c.parse::<usize>().ok())
        .filter(|c| *c > 0)
        .unwrap_or(1);

    match state.discovery.find(&protocol, count).await {
        Ok(descs) => Json(descs).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_register(
    State(state): State<DiscoveryState>,
    Path(id): Path<String>,
    Json(mut reg): Json<ServiceRegistration>,
) -> impl IntoResponse {
    if reg.id.is_empty() {
        reg.id = id;
    }
    match state.discovery.register(reg).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn register_then_lookup_over_http() {
        let base = serve(router(Arc::new(MemoryDiscovery::new()))).await;
        let client = crate::DiscoveryClient::new(&base);

        client
            .register(ServiceRegistration {
                id: "a".repeat(64),
                address: "http://peer.example".to_string(),
                protocols: vec!["storage-v1".to_string()],
            })
            .await
            .unwrap();

        let desc = client.get(&"a".repeat(64)).await.unwrap();
        assert_eq!(desc.address, "http://peer.example");

        let found = client.find("storage-v1", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(client.find("slots-v1", 5).await.unwrap().is_empty());
        assert_eq!(client.id().await.unwrap().len(), 64);
    }
}
