//! HTTP client for a remote name registry.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::names::{NameEntry, NameStore};
use crate::{RegistryError, Result};

/// Talks to a `names-v1` service.
#[derive(Debug, Clone)]
pub struct NamesClient {
    base_url: String,
    http: reqwest::Client,
}

impl NamesClient {
    /// Create a client for the registry at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NameStore for NamesClient {
    async fn get(&self, name: &str) -> Result<NameEntry> {
        let resp = self
            .http
            .get(format!("{}/{name}", self.base_url))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(name.to_string())),
            status => Err(RegistryError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn put(&self, name: &str, value: &str, tokens: &[String]) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/{name}", self.base_url))
            .query(&[("value", value), ("tokens", &tokens.join(","))])
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(RegistryError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn delete(&self, name: &str, expected_value: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/{name}", self.base_url))
            .header("If-Match", expected_value)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(name.to_string())),
            StatusCode::PRECONDITION_FAILED => {
                Err(RegistryError::PreconditionFailed(name.to_string()))
            }
            status => Err(RegistryError::UnexpectedStatus(status.as_u16())),
        }
    }
}
