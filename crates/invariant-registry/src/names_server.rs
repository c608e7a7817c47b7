//! axum HTTP surface for a name registry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::names::NameStore;
use crate::RegistryError;

#[derive(Clone)]
struct NamesState {
    names: Arc<dyn NameStore>,
}

/// Build the names router: `GET /{name}`, `PUT /{name}?value=&tokens=`,
/// `DELETE /{name}` with `If-Match`.
pub fn router(names: Arc<dyn NameStore>) -> Router {
    Router::new()
        .route(
            "/{name}",
            get(handle_get).put(handle_put).delete(handle_delete),
        )
        .with_state(NamesState { names })
}

async fn handle_get(
    State(state): State<NamesState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.names.get(&name).await {
        Ok(entry) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = entry.value.parse() {
                headers.insert("ETag", value);
            }
            (headers, Json(entry)).into_response()
        }
        Err(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_put(
    State(state): State<NamesState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value").filter(|v| !v.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(tokens) = params.get("tokens").filter(|t| !t.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let tokens: Vec<String> = tokens.split(',').map(|t| t.to_string()).collect();

    match state.names.put(&name, value, &tokens).await {
        Ok(()) => {
            let mut headers = HeaderMap::new();
            if let Ok(v) = value.parse() {
                headers.insert("ETag", v);
            }
            (headers, StatusCode::OK).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_delete(
    State(state): State<NamesState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let expected = headers
        .get("If-Match")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match state.names.delete(&name, expected).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(RegistryError::PreconditionFailed(_)) => {
            StatusCode::PRECONDITION_FAILED.into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::MemoryNames;
    use crate::NamesClient;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn name_lifecycle_over_http() {
        let base = serve(router(Arc::new(MemoryNames::new()))).await;
        let client = NamesClient::new(&base);

        let tokens = vec!["storage-v1".to_string()];
        client.put("alpha", "value1", &tokens).await.unwrap();

        let entry = client.get("alpha").await.unwrap();
        assert_eq!(entry.value, "value1");
        assert_eq!(entry.tokens, tokens);

        assert!(matches!(
            client.delete("alpha", "stale").await,
            Err(RegistryError::PreconditionFailed(_))
        ));
        client.delete("alpha", "value1").await.unwrap();
        assert!(matches!(
            client.get("alpha").await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
