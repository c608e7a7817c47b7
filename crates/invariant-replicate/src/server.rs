//! axum HTTP surface for the replication controller (`distribute-v1`).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};

use invariant_locator::HasRequest;
use invariant_registry::identity;

use crate::controller::ReplicationController;

#[derive(Clone)]
struct DistributeState {
    id: String,
    controller: Arc<ReplicationController>,
}

/// Build the distribute router: `GET /id`, `PUT /register/{id}`,
/// `PUT /has/{id}`.
pub fn router(controller: Arc<ReplicationController>) -> Router {
    Router::new()
        .route("/id", get(handle_id))
        .route("/register/{id}", put(handle_register))
        .route("/has/{id}", put(handle_has))
        .with_state(DistributeState {
            id: identity::random_id(),
            controller,
        })
}

async fn handle_id(State(state): State<DistributeState>) -> impl IntoResponse {
    state.id.clone()
}

async fn handle_register(
    State(state): State<DistributeState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    state.controller.register(&id);
    StatusCode::OK
}

async fn handle_has(
    State(state): State<DistributeState>,
    Path(id): Path<String>,
    Json(body): Json<HasRequest>,
) -> impl IntoResponse {
    state.controller.has(&id, &body.addresses);
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DistributeClient;
    use crate::controller::ReplicationConfig;
    use invariant_locator::HasClient;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn register_and_has_over_http() {
        let controller = Arc::new(ReplicationController::new(
            None,
            ReplicationConfig::default(),
        ));
        let base = serve(router(Arc::clone(&controller))).await;

        let peer = hex::encode([9u8; 32]);
        DistributeClient::new(&base).register(&peer).await.unwrap();
        assert_eq!(controller.registered_ids(), vec![peer.clone()]);

        let block = hex::encode([7u8; 32]);
        HasClient::new(&base)
            .has(&peer, std::slice::from_ref(&block))
            .await
            .unwrap();
        assert_eq!(controller.blocks_of(&peer), vec![block]);
    }
}
