//! HTTP client for a remote discovery registry.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::discovery::{Discovery, ServiceDescription, ServiceRegistration};
use crate::{RegistryError, Result};

/// Talks to a discovery registry over its HTTP surface.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DiscoveryClient {
    /// Create a client for the registry at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the registry's own id.
    pub async fn id(&self) -> Result<String> {
        let resp = self.http.get(format!("{}/id", self.base_url)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(RegistryError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl Discovery for DiscoveryClient {
    async fn get(&self, id: &str) -> Option<ServiceDescription> {
        let resp = self
            .http
            .get(format!("{}/{id}", self.base_url))
            .send()
            .await
            .ok()?;
        if resp.status() != StatusCode::OK {
            return None;
        }
        resp.json().await.ok()
    }

    async fn find(&self, protocol: &str, count: usize) -> Result<Vec<ServiceDescription>> {
        let resp = self
            .http
            .get(format!("{}/", self.base_url))
            .query(&[("protocol", protocol), ("count", &count.to_string())])
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(RegistryError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    async fn register(&self, reg: ServiceRegistration) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/{}", self.base_url, reg.id))
            .json(&reg)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(RegistryError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(())
    }
}
