//! Discovery registry: peers advertise `{id, address, protocols}` and look
//! each other up by id or protocol token.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::names::NameStore;
use crate::{names_client::NamesClient, RegistryError, Result};

/// A registered service as returned by lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    /// 64-hex peer id.
    pub id: String,
    /// Base URL the peer serves HTTP on.
    pub address: String,
    /// Protocol tokens the peer speaks (`storage-v1`, `finder-v1`, ...).
    pub protocols: Vec<String>,
}

/// The payload used to register a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// 64-hex peer id.
    pub id: String,
    /// Base URL the peer serves HTTP on.
    pub address: String,
    /// Protocol tokens the peer speaks.
    pub protocols: Vec<String>,
}

/// The discovery surface used by every other component.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Look up a single peer by id.
    async fn get(&self, id: &str) -> Option<ServiceDescription>;
    /// Return up to `count` peers speaking `protocol`.
    async fn find(&self, protocol: &str, count: usize) -> Result<Vec<ServiceDescription>>;
    /// Register (or re-register) a peer.
    async fn register(&self, reg: ServiceRegistration) -> Result<()>;
}

/// In-process discovery registry.
#[derive(Default)]
pub struct MemoryDiscovery {
    services: RwLock<HashMap<String, ServiceRegistration>>,
}

impl MemoryDiscovery {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn get(&self, id: &str) -> Option<ServiceDescription> {
        let services = self.services.read().expect("discovery lock poisoned");
        services.get(id).map(|reg| ServiceDescription {
            id: reg.id.clone(),
            address: reg.address.clone(),
            protocols: reg.protocols.clone(),
        })
    }

    async fn find(&self, protocol: &str, count: usize) -> Result<Vec<ServiceDescription>> {
        if protocol.is_empty() {
            return Ok(Vec::new());
        }
        let services = self.services.read().expect("discovery lock poisoned");
        let mut results = Vec::new();
        for reg in services.values() {
            if reg.protocols.iter().any(|p| p == protocol) {
                results.push(ServiceDescription {
                    id: reg.id.clone(),
                    address: reg.address.clone(),
                    protocols: reg.protocols.clone(),
                });
                if results.len() >= count {
                    break;
                }
            }
        }
        Ok(results)
    }

    async fn register(&self, reg: ServiceRegistration) -> Result<()> {
        let mut services = self.services.write().expect("discovery lock poisoned");
        services.insert(reg.id.clone(), reg);
        Ok(())
    }
}

/// Complete the advertised URL (default host, appended port) and register
/// the peer with the discovery registry.
pub async fn advertise_and_register(
    discovery: &dyn Discovery,
    id: &str,
    advertise: &str,
    port: u16,
    protocols: &[&str],
) -> Result<()> {
    let address = if advertise.is_empty() {
        format!("http://localhost:{port}")
    } else {
        let mut address = advertise.to_string();
        if !address.starts_with("http://") && !address.starts_with("https://") {
            address = format!("http://{address}");
        }
        // Append the port when the advertised host does not carry one.
        let after_scheme = address.splitn(2, "//").nth(1).unwrap_or("");
        if !after_scheme.contains(':') {
            address = format!("{address}:{port}");
        }
        address
    };

    discovery
        .register(ServiceRegistration {
            id: id.to_string(),
            address,
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
        })
        .await
}

/// Resolve an id-or-name argument to a 64-hex peer id: 64-hex values pass
/// through, anything else is looked up against the registered `names-v1`
/// services.
pub async fn resolve_name(discovery: &dyn Discovery, id_or_name: &str) -> Result<String> {
    if id_or_name.len() == 64 {
        return Ok(id_or_name.to_string());
    }

    let names_servers = discovery.find("names-v1", 100).await?;
    for server in &names_servers {
        let client = NamesClient::new(&server.address);
        if let Ok(entry) = client.get(id_or_name).await {
            return Ok(entry.value);
        }
    }

    Err(RegistryError::NotFound(format!(
        "could not resolve name {id_or_name} through any names service"
    )))
}

/// Register a logical name for a peer id with the first available `names-v1`
/// service.
pub async fn register_name(
    discovery: &dyn Discovery,
    name: &str,
    id: &str,
    protocols: &[&str],
) -> Result<()> {
    let names_servers = discovery.find("names-v1", 1).await?;
    let server = names_servers.first().ok_or_else(|| {
        RegistryError::NotFound("no names-v1 service registered with discovery".to_string())
    })?;
    let client = NamesClient::new(&server.address);
    let tokens: Vec<String> = protocols.iter().map(|p| p.to_string()).collect();
    client.put(name, id, &tokens).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, protocols: &[&str]) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            address: format!("http://{id}.example"),
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let d = MemoryDiscovery::new();
        d.register(reg("a", &["storage-v1"])).await.unwrap();
        let desc = d.get("a").await.unwrap();
        assert_eq!(desc.address, "http://a.example");
        assert!(d.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn find_filters_by_protocol_and_count() {
        let d = MemoryDiscovery::new();
        d.register(reg("a", &["storage-v1"])).await.unwrap();
        d.register(reg("b", &["storage-v1", "finder-v1"])).await.unwrap();
        d.register(reg("c", &["slots-v1"])).await.unwrap();

        let found = d.find("storage-v1", 10).await.unwrap();
        assert_eq!(found.len(), 2);
        let found = d.find("storage-v1", 1).await.unwrap();
        assert_eq!(found.len(), 1);
        let found = d.find("names-v1", 10).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn advertise_completes_missing_pieces() {
        let d = MemoryDiscovery::new();
        advertise_and_register(&d, "peer1", "", 8080, &["storage-v1"])
            .await
            .unwrap();
        assert_eq!(d.get("peer1").await.unwrap().address, "http://localhost:8080");

        advertise_and_register(&d, "peer2", "node.example", 9000, &["storage-v1"])
            .await
            .unwrap();
        assert_eq!(
            d.get("peer2").await.unwrap().address,
            "http://node.example:9000"
        );

        advertise_and_register(&d, "peer3", "http://node.example:7000", 9000, &["storage-v1"])
            .await
            .unwrap();
        assert_eq!(
            d.get("peer3").await.unwrap().address,
            "http://node.example:7000"
        );
    }

    #[tokio::test]
    async fn resolve_name_passes_hex_through() {
        let d = MemoryDiscovery::new();
        let id = "ab".repeat(32);
        assert_eq!(resolve_name(&d, &id).await.unwrap(), id);
    }
}
