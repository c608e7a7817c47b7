//! axum HTTP surface for a slot registry.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::slots::{SlotRegistration, SlotStore, SlotUpdate};
use crate::RegistryError;

#[derive(Clone)]
struct SlotsState {
    slots: Arc<dyn SlotStore>,
}

/// Build the slots router: `GET /id`, `GET /{id}`, `POST /{id}`, `PUT /{id}`.
pub fn router(slots: Arc<dyn SlotStore>) -> Router {
    Router::new()
        .route("/id", get(handle_id))
        .route(
            "/{id}",
            get(handle_get).post(handle_create).put(handle_update),
        )
        .with_state(SlotsState { slots })
}

async fn handle_id(State(state): State<SlotsState>) -> impl IntoResponse {
    state.slots.id()
}

async fn handle_get(
    State(state): State<SlotsState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.slots.get(&id).await {
        Ok(address) => address.into_response(),
        Err(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_create(
    State(state): State<SlotsState>,
    Path(id): Path<String>,
    Json(body): Json<SlotRegistration>,
) -> impl IntoResponse {
    match state.slots.create(&id, &body.address).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(RegistryError::Conflict(_)) => StatusCode::CONFLICT.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_update(
    State(state): State<SlotsState>,
    Path(id): Path<String>,
    Json(body): Json<SlotUpdate>,
) -> impl IntoResponse {
    match state
        .slots
        .update(&id, &body.address, &body.previous_address)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(RegistryError::PreconditionFailed(_)) => StatusCode::CONFLICT.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::MemorySlots;
    use crate::SlotsClient;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn cas_protocol_over_http() {
        let base = serve(router(Arc::new(MemorySlots::new()))).await;
        let client = SlotsClient::new(&base);

        client.create("slot1", "addr0").await.unwrap();
        assert_eq!(client.get("slot1").await.unwrap(), "addr0");

        assert!(matches!(
            client.create("slot1", "x").await,
            Err(RegistryError::Conflict(_))
        ));

        client.update("slot1", "addr1", "addr0").await.unwrap();
        assert_eq!(client.get("slot1").await.unwrap(), "addr1");

        assert!(matches!(
            client.update("slot1", "addr2", "addr0").await,
            Err(RegistryError::PreconditionFailed(_))
        ));
        assert!(matches!(
            client.update("missing", "a", "b").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            client.get("missing").await,
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(client.remote_id().await.unwrap().len(), 64);
    }
}
