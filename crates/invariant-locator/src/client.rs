//! HTTP client for a remote finder.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::has::HasClient;
use crate::locator::{FindResponse, Locator};
use crate::{LocatorError, Result};

/// Talks to a `finder-v1` service.
#[derive(Debug, Clone)]
pub struct FinderClient {
    base_url: String,
    http: reqwest::Client,
}

impl FinderClient {
    /// Create a client for the finder at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Locator for FinderClient {
    fn id(&self) -> String {
        // The remote finder's id is only needed locally for routing; the
        // client does not cache it.
        String::new()
    }

    async fn find(&self, address: &str) -> Result<Vec<FindResponse>> {
        let resp = self
            .http
            .get(format!("{}/{address}", self.base_url))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(LocatorError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    async fn has(&self, holder: &str, addresses: &[String]) -> Result<()> {
        HasClient::new(&self.base_url).has(holder, addresses).await
    }

    async fn notify(&self, peer: &str) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/notify/{peer}", self.base_url))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(LocatorError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(())
    }
}
