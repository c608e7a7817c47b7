//! axum HTTP surface for a storage peer.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use invariant_registry::Discovery;

use crate::client::StorageClient;
use crate::store::{is_valid_address, BlobStore, FetchRequest};

#[derive(Clone)]
struct StorageState {
    id: String,
    store: Arc<dyn BlobStore>,
    discovery: Option<Arc<dyn Discovery>>,
}

/// Build the storage router: `GET /id`, `GET|HEAD /storage/{addr}`,
/// `POST /storage/`, `PUT /storage/{addr}`, `POST|HEAD /storage/fetch`.
/// Fetch requires discovery and answers 404 without it.
pub fn router(
    id: String,
    store: Arc<dyn BlobStore>,
    discovery: Option<Arc<dyn Discovery>>,
) -> Router {
    Router::new()
        .route("/id", get(handle_id))
        .route("/storage/", post(handle_store))
        .route(
            "/storage/fetch",
            post(handle_fetch).head(handle_fetch_head),
        )
        .route(
            "/storage/{address}",
            get(handle_get).head(handle_head).put(handle_store_at),
        )
        // Chunks run up to 2 MiB before padding; leave generous headroom.
        .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
        .with_state(StorageState {
            id,
            store,
            discovery,
        })
}

async fn handle_id(State(state): State<StorageState>) -> impl IntoResponse {
    state.id.clone()
}

fn blob_headers(address: &str, size: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().expect("static header"),
    );
    headers.insert(header::CACHE_CONTROL, "immutable".parse().expect("static header"));
    if let Ok(etag) = address.parse() {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(len) = size.to_string().parse() {
        headers.insert(header::CONTENT_LENGTH, len);
    }
    headers
}

async fn handle_get(
    State(state): State<StorageState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    if !is_valid_address(&address) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.store.get(&address).await {
        Ok(Some(data)) => {
            let headers = blob_headers(&address, data.len() as u64);
            (headers, data).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_head(
    State(state): State<StorageState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    if !is_valid_address(&address) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.store.size(&address).await {
        Ok(Some(size)) => (blob_headers(&address, size), StatusCode::OK).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_store(State(state): State<StorageState>, body: Bytes) -> impl IntoResponse {
    match state.store.store(body).await {
        Ok(address) => address.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_store_at(
    State(state): State<StorageState>,
    Path(address): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !is_valid_address(&address) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.store.store_at(&address, body).await {
        Ok(true) => address.into_response(),
        Ok(false) => StatusCode::BAD_REQUEST.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_fetch_head(State(state): State<StorageState>) -> StatusCode {
    if state.discovery.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn handle_fetch(
    State(state): State<StorageState>,
    Json(req): Json<FetchRequest>,
) -> impl IntoResponse {
    let Some(discovery) = state.discovery.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if req.address.is_empty() || req.container.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if !is_valid_address(&req.address) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    // Already holding the block counts as success.
    if matches!(state.store.has(&req.address).await, Ok(true)) {
        return StatusCode::OK.into_response();
    }

    let Some(desc) = discovery.get(&req.container).await else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let remote = StorageClient::new(&desc.address);
    let data = match remote.get(&req.address).await {
        Ok(Some(data)) => data,
        Ok(None) | Err(_) => {
            debug!(address = %req.address, container = %req.container, "fetch source failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    match state.store.store_at(&req.address, data).await {
        Ok(true) => StatusCode::OK.into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::address_of;
    use invariant_registry::{MemoryDiscovery, ServiceRegistration};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn serve_store(store: Arc<MemoryStore>) -> String {
        serve(router(store.id().to_string(), store, None)).await
    }

    #[tokio::test]
    async fn store_get_head_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let base = serve_store(Arc::clone(&store)).await;
        let client = StorageClient::new(&base);

        let addr = client
            .store(bytes::Bytes::from_static(b"over the wire"))
            .await
            .unwrap();
        assert_eq!(addr, address_of(b"over the wire"));
        assert!(client.has(&addr).await.unwrap());
        assert_eq!(client.size(&addr).await.unwrap(), Some(13));
        assert_eq!(
            client.get(&addr).await.unwrap().unwrap(),
            bytes::Bytes::from_static(b"over the wire")
        );
        assert_eq!(client.remote_id().await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn blob_response_headers() {
        let store = Arc::new(MemoryStore::new());
        let base = serve_store(Arc::clone(&store)).await;
        let addr = store
            .store(bytes::Bytes::from_static(b"headers"))
            .await
            .unwrap();

        let resp = reqwest::get(format!("{base}/storage/{addr}")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers().get("etag").unwrap().to_str().unwrap(),
            addr
        );
        assert_eq!(
            resp.headers().get("cache-control").unwrap().to_str().unwrap(),
            "immutable"
        );
    }

    #[tokio::test]
    async fn malformed_address_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let base = serve_store(store).await;
        let resp = reqwest::get(format!("{base}/storage/NOT-AN-ADDRESS"))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn put_with_wrong_digest_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let base = serve_store(store).await;
        let client = StorageClient::new(&base);
        let addr = address_of(b"expected");
        assert!(!client
            .store_at(&addr, bytes::Bytes::from_static(b"different"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn fetch_pulls_block_from_container() {
        // Source peer holding the block.
        let source = Arc::new(MemoryStore::new());
        let source_base = serve_store(Arc::clone(&source)).await;
        let addr = source
            .store(bytes::Bytes::from_static(b"replicate me"))
            .await
            .unwrap();

        let discovery = Arc::new(MemoryDiscovery::new());
        discovery
            .register(ServiceRegistration {
                id: source.id().to_string(),
                address: source_base,
                protocols: vec!["storage-v1".to_string()],
            })
            .await
            .unwrap();

        // Destination peer with fetch support.
        let dest = Arc::new(MemoryStore::new());
        let dest_base = serve(router(
            dest.id().to_string(),
            Arc::clone(&dest) as Arc<dyn BlobStore>,
            Some(discovery as Arc<dyn Discovery>),
        ))
        .await;

        let client = StorageClient::new(&dest_base);
        client.fetch(&addr, source.id()).await.unwrap();
        assert!(dest.has(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn fetch_without_discovery_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let base = serve_store(store).await;
        let client = StorageClient::new(&base);
        let err = client.fetch(&address_of(b"x"), &"a".repeat(64)).await;
        assert!(matches!(err, Err(crate::StorageError::FetchFailed(_))));
    }
}
