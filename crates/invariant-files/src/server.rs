//! axum HTTP surface for the file-tree engine.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};

use invariant_content::ContentLink;

use crate::engine::{EntryAttributes, FileTree};
use crate::manifest::EntryKind;
use crate::{FileTreeError, ROOT_NODE};

#[derive(Clone)]
struct FilesState {
    tree: Arc<FileTree>,
}

/// Build the files router.
pub fn router(tree: Arc<FileTree>) -> Router {
    Router::new()
        .route("/remove/{node}/{name}", put(handle_remove))
        .route("/rename/{node}/{name}", post(handle_rename))
        .route("/link/{node}/{name}", put(handle_link))
        .route("/lookup/{node}/{name}", get(handle_lookup))
        .route("/file/{node}", get(handle_read_file).post(handle_write_file))
        .route("/directory/{node}", get(handle_read_directory))
        .route(
            "/attributes/{node}",
            get(handle_get_attributes).post(handle_set_attributes),
        )
        .route("/content/{node}", get(handle_get_content))
        .route("/info/{node}", get(handle_get_info))
        .route("/sync", put(handle_sync))
        .route("/{node}/{name}", put(handle_create))
        .layer(DefaultBodyLimit::max(256 * 1024 * 1024))
        .with_state(FilesState { tree })
}

fn error_response(e: FileTreeError) -> axum::response::Response {
    let status = match &e {
        FileTreeError::ReadOnly => StatusCode::FORBIDDEN,
        FileTreeError::UnknownNode(_) | FileTreeError::EntryNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        FileTreeError::CasConflict(_) => StatusCode::CONFLICT,
        FileTreeError::BadRequest(_)
        | FileTreeError::NotADirectory(_)
        | FileTreeError::NotAFile(_)
        | FileTreeError::MalformedManifest(_) => StatusCode::BAD_REQUEST,
        FileTreeError::Content(_) | FileTreeError::Slot(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

fn parse_kind(raw: Option<&String>) -> Result<EntryKind, axum::response::Response> {
    match raw.map(String::as_str) {
        None | Some("File") => Ok(EntryKind::File),
        Some("Directory") => Ok(EntryKind::Directory),
        Some("SymbolicLink") => Ok(EntryKind::SymbolicLink),
        Some(other) => Err((
            StatusCode::BAD_REQUEST,
            format!("unknown entry kind: {other}"),
        )
            .into_response()),
    }
}

async fn handle_create(
    State(state): State<FilesState>,
    Path((node, name)): Path<(u64, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let kind = match parse_kind(params.get("kind")) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let content: Option<ContentLink> = match params.get("content") {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(link) => Some(link),
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "invalid content link").into_response()
            }
        },
        None => None,
    };
    let target = params.get("target").cloned().unwrap_or_default();
    let data = if body.is_empty() { None } else { Some(&body[..]) };

    match state
        .tree
        .create_entry(node, &name, kind, &target, content, data)
        .await
    {
        Ok(id) => (StatusCode::CREATED, id.to_string()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_remove(
    State(state): State<FilesState>,
    Path((node, name)): Path<(u64, String)>,
) -> impl IntoResponse {
    match state.tree.remove(node, &name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_rename(
    State(state): State<FilesState>,
    Path((node, name)): Path<(u64, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let new_parent = params
        .get("newParent")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(node);
    let new_name = params
        .get("newName")
        .cloned()
        .unwrap_or_else(|| name.clone());

    match state.tree.rename(node, &name, new_parent, &new_name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_link(
    State(state): State<FilesState>,
    Path((node, name)): Path<(u64, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(target) = params.get("target").and_then(|v| v.parse::<u64>().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing target node id").into_response();
    };
    match state.tree.link(node, &name, target).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_lookup(
    State(state): State<FilesState>,
    Path((node, name)): Path<(u64, String)>,
) -> impl IntoResponse {
    match state.tree.lookup(node, &name).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_read_file(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let offset = params
        .get("offset")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let length = params
        .get("length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    match state.tree.read_file(node, offset, length).await {
        Ok(data) => data.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_write_file(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let offset = params
        .get("offset")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let append = params.get("append").map(String::as_str) == Some("true");
    match state.tree.write_file(node, offset, append, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_read_directory(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
) -> impl IntoResponse {
    match state.tree.read_directory(node).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get_attributes(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
) -> impl IntoResponse {
    match state.tree.get_attributes(node).await {
        Ok(attrs) => Json(attrs).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_set_attributes(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
    Json(attrs): Json<EntryAttributes>,
) -> impl IntoResponse {
    match state.tree.set_attributes(node, attrs).await {
        Ok(attrs) => Json(attrs).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get_content(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
) -> impl IntoResponse {
    match state.tree.get_content(node).await {
        Ok(link) => Json(link).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get_info(
    State(state): State<FilesState>,
    Path(node): Path<u64>,
) -> impl IntoResponse {
    match state.tree.get_info(node).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_sync(
    State(state): State<FilesState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let node = params
        .get("node")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(ROOT_NODE);
    let wait = params.get("wait").map(String::as_str) != Some("false");
    match state.tree.sync(node, wait).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FileTreeConfig;
    use invariant_registry::{MemorySlots, SlotStore};
    use invariant_storage::{BlobStore, MemoryStore};

    async fn serve_tree() -> (String, Arc<MemorySlots>) {
        let store = Arc::new(MemoryStore::new());
        let slots = Arc::new(MemorySlots::new());
        let tree = FileTree::new(
            store as Arc<dyn BlobStore>,
            Some(Arc::clone(&slots) as Arc<dyn SlotStore>),
            ContentLink::slot("http-root"),
            FileTreeConfig::default(),
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = router(tree);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), slots)
    }

    #[tokio::test]
    async fn create_write_read_over_http() {
        let (base, slots) = serve_tree().await;
        let http = reqwest::Client::new();

        let resp = http
            .put(format!("{base}/1/notes.txt?kind=File"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 201);
        let node: u64 = resp.text().await.unwrap().parse().unwrap();

        let resp = http
            .post(format!("{base}/file/{node}"))
            .body("written over http")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        let resp = http.get(format!("{base}/file/{node}")).send().await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "written over http");

        let resp = http.put(format!("{base}/sync?wait=true")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(!slots.get("http-root").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let (base, _slots) = serve_tree().await;
        let http = reqwest::Client::new();

        // Unknown node.
        let resp = http.get(format!("{base}/file/999")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        // Reserved name.
        let resp = http
            .put(format!("{base}/1/CON.txt?kind=File"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        // Unknown kind.
        let resp = http
            .put(format!("{base}/1/x?kind=Socket"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn directory_listing_and_lookup() {
        let (base, _slots) = serve_tree().await;
        let http = reqwest::Client::new();

        http.put(format!("{base}/1/sub?kind=Directory"))
            .send()
            .await
            .unwrap();
        http.put(format!("{base}/1/alias?kind=SymbolicLink&target=sub"))
            .send()
            .await
            .unwrap();

        let entries: serde_json::Value = http
            .get(format!("{base}/directory/1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let names: Vec<&str> = entries
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alias", "sub"]);

        let info: serde_json::Value = http
            .get(format!("{base}/lookup/1/sub"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["kind"], "Directory");
        assert_eq!(info["writable"], true);
    }

    #[tokio::test]
    async fn read_only_tree_answers_forbidden() {
        let store = Arc::new(MemoryStore::new());
        let tree = FileTree::new(
            store as Arc<dyn BlobStore>,
            None,
            ContentLink::plain(""),
            FileTreeConfig::default(),
        )
        .await
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = router(tree);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let base = format!("http://{addr}");

        let resp = reqwest::Client::new()
            .put(format!("{base}/1/x?kind=File"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 403);
    }
}
