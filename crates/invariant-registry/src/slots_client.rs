//! HTTP client for a remote slot registry.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::slots::{SlotRegistration, SlotStore, SlotUpdate};
use crate::{RegistryError, Result};

/// Talks to a `slots-v1` service.
#[derive(Debug, Clone)]
pub struct SlotsClient {
    base_url: String,
    http: reqwest::Client,
}

impl SlotsClient {
    /// Create a client for the registry at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the remote registry's id.
    pub async fn remote_id(&self) -> Result<String> {
        let resp = self.http.get(format!("{}/id", self.base_url)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(RegistryError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl SlotStore for SlotsClient {
    fn id(&self) -> String {
        // The local id is meaningless for a remote registry; callers that
        // need it use `remote_id`.
        String::new()
    }

    async fn get(&self, slot: &str) -> Result<String> {
        let resp = self
            .http
            .get(format!("{}/{slot}", self.base_url))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.text().await?),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(slot.to_string())),
            status => Err(RegistryError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn create(&self, slot: &str, address: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/{slot}", self.base_url))
            .json(&SlotRegistration {
                address: address.to_string(),
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(RegistryError::Conflict(slot.to_string())),
            status => Err(RegistryError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn update(&self, slot: &str, address: &str, previous_address: &str) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/{slot}", self.base_url))
            .json(&SlotUpdate {
                address: address.to_string(),
                previous_address: previous_address.to_string(),
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(slot.to_string())),
            StatusCode::CONFLICT => Err(RegistryError::PreconditionFailed(slot.to_string())),
            status => Err(RegistryError::UnexpectedStatus(status.as_u16())),
        }
    }
}
