//! HTTP client for a remote replication controller.

use reqwest::StatusCode;

use crate::{ReplicateError, Result};

/// Talks to a `distribute-v1` service. Block reports go through the shared
/// `has-v1` client.
#[derive(Debug, Clone)]
pub struct DistributeClient {
    base_url: String,
    http: reqwest::Client,
}

impl DistributeClient {
    /// Create a client for the controller at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Register a storage peer id with the controller.
    pub async fn register(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/register/{id}", self.base_url))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(ReplicateError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(())
    }

    /// Fetch the controller's id.
    pub async fn remote_id(&self) -> Result<String> {
        let resp = self.http.get(format!("{}/id", self.base_url)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(ReplicateError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(resp.text().await?)
    }
}
