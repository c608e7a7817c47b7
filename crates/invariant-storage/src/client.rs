//! HTTP client for a remote storage peer.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use crate::store::{BlobStore, FetchRequest};
use crate::{Result, StorageError};

/// True for status codes that indicate the peer itself is unhealthy rather
/// than the request being wrong.
fn is_dead_peer_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Talks to a `storage-v1` peer. Transport failures and gateway-class 5xx
/// responses surface as [`StorageError::Transient`] so callers can treat
/// the peer as dead.
#[derive(Debug, Clone)]
pub struct StorageClient {
    base_url: String,
    http: reqwest::Client,
}

impl StorageClient {
    /// Create a client for the peer at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// The peer's base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the peer's id.
    pub async fn remote_id(&self) -> Result<String> {
        let resp = self.http.get(format!("{}/id", self.base_url)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(StorageError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(resp.text().await?)
    }

    /// Instruct the peer to fetch `address` from peer `container`.
    pub async fn fetch(&self, address: &str, container: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/storage/fetch", self.base_url))
            .json(&FetchRequest {
                address: address.to_string(),
                container: container.to_string(),
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(StorageError::FetchFailed(format!(
                "peer answered {status}"
            ))),
        }
    }

    fn classify(&self, status: StatusCode) -> StorageError {
        if is_dead_peer_status(status) {
            StorageError::Transient(format!("peer answered {status}"))
        } else {
            StorageError::UnexpectedStatus(status.as_u16())
        }
    }
}

#[async_trait]
impl BlobStore for StorageClient {
    async fn has(&self, address: &str) -> Result<bool> {
        let resp = self
            .http
            .head(format!("{}/storage/{address}", self.base_url))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.classify(status)),
        }
    }

    async fn get(&self, address: &str) -> Result<Option<Bytes>> {
        let resp = self
            .http
            .get(format!("{}/storage/{address}", self.base_url))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.bytes().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(self.classify(status)),
        }
    }

    async fn store(&self, data: Bytes) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/storage/", self.base_url))
            .body(data)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.text().await?),
            status => Err(self.classify(status)),
        }
    }

    async fn store_at(&self, address: &str, data: Bytes) -> Result<bool> {
        let resp = self
            .http
            .put(format!("{}/storage/{address}", self.base_url))
            .body(data)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::BAD_REQUEST => Ok(false),
            status => Err(self.classify(status)),
        }
    }

    async fn size(&self, address: &str) -> Result<Option<u64>> {
        let resp = self
            .http
            .head(format!("{}/storage/{address}", self.base_url))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let size = resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Ok(size)
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(self.classify(status)),
        }
    }
}
