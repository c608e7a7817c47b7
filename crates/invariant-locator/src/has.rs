//! `has-v1` client and the batching notifier that feeds it.
//!
//! Storage and slot peers push the addresses they hold to interested
//! consumers (location indexes and replication controllers). Pushes are
//! batched by size and time; the index is advisory, so lost batches are
//! tolerated.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::locator::HasRequest;
use crate::{LocatorError, Result};

/// Client for any service accepting `PUT /has/{peer-id}`.
#[derive(Debug, Clone)]
pub struct HasClient {
    base_url: String,
    http: reqwest::Client,
}

impl HasClient {
    /// Create a client for the consumer at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Report that peer `holder` has the given addresses.
    pub async fn has(&self, holder: &str, addresses: &[String]) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/has/{holder}", self.base_url))
            .json(&HasRequest {
                addresses: addresses.to_vec(),
            })
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(LocatorError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Batching configuration for a [`HasNotifier`].
#[derive(Debug, Clone)]
pub struct HasNotifierConfig {
    /// Flush when this many addresses have accumulated.
    pub batch_size: usize,
    /// Flush at least this often while addresses are pending.
    pub batch_interval: Duration,
}

impl Default for HasNotifierConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            batch_interval: Duration::from_secs(1),
        }
    }
}

/// Background task pushing stored addresses to `has-v1` consumers.
pub struct HasNotifier {
    task: JoinHandle<()>,
}

impl HasNotifier {
    /// Start the pusher: first announces everything in `initial`, then
    /// forwards addresses arriving on `feed` in batches. `holder` is the id
    /// reported as owning the addresses.
    pub fn start(
        holder: String,
        clients: Vec<HasClient>,
        initial: Vec<String>,
        mut feed: broadcast::Receiver<String>,
        config: HasNotifierConfig,
    ) -> Self {
        let task = tokio::spawn(async move {
            for chunk in initial.chunks(config.batch_size.max(1)) {
                send_to_all(&clients, &holder, chunk).await;
            }

            let mut batch: Vec<String> = Vec::new();
            let mut ticker = tokio::time::interval(config.batch_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = feed.recv() => match received {
                        Ok(address) => {
                            batch.push(address);
                            if batch.len() >= config.batch_size {
                                send_to_all(&clients, &holder, &batch).await;
                                batch.clear();
                                ticker.reset();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Acceptable loss: the index is advisory.
                            warn!(missed, "has feed lagged, dropping notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            if !batch.is_empty() {
                                send_to_all(&clients, &holder, &batch).await;
                            }
                            return;
                        }
                    },
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            send_to_all(&clients, &holder, &batch).await;
                            batch.clear();
                        }
                    }
                }
            }
        });
        Self { task }
    }
}

impl Drop for HasNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_to_all(clients: &[HasClient], holder: &str, addresses: &[String]) {
    for client in clients {
        if let Err(e) = client.has(holder, addresses).await {
            debug!(error = %e, count = addresses.len(), "has push failed");
        }
    }
}
