//! Name registry: logical name → (value, protocol tokens).
//!
//! Names let operators refer to peers by something memorable instead of a
//! 64-hex id. A DNS TXT record of the form `invariant:{value};{t1,t2}` can
//! stand in for a registry entry when resolving outside the federation; the
//! lookup itself is left to the caller, only the record format lives here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use invariant_durable::{DurableMap, DurableMapConfig};

use crate::{RegistryError, Result};

/// The data stored for a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    /// The value a name resolves to, usually a 64-hex peer id.
    pub value: String,
    /// Protocol tokens associated with the value.
    pub tokens: Vec<String>,
}

/// The name registry surface.
#[async_trait]
pub trait NameStore: Send + Sync {
    /// Resolve a name.
    async fn get(&self, name: &str) -> Result<NameEntry>;
    /// Create or replace a name.
    async fn put(&self, name: &str, value: &str, tokens: &[String]) -> Result<()>;
    /// Delete a name; a non-empty `expected_value` must match the stored
    /// value.
    async fn delete(&self, name: &str, expected_value: &str) -> Result<()>;
}

/// In-process name registry.
#[derive(Default)]
pub struct MemoryNames {
    entries: RwLock<HashMap<String, NameEntry>>,
}

impl MemoryNames {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NameStore for MemoryNames {
    async fn get(&self, name: &str) -> Result<NameEntry> {
        let entries = self.entries.read().expect("names lock poisoned");
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn put(&self, name: &str, value: &str, tokens: &[String]) -> Result<()> {
        let mut entries = self.entries.write().expect("names lock poisoned");
        entries.insert(
            name.to_string(),
            NameEntry {
                value: value.to_string(),
                tokens: tokens.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str, expected_value: &str) -> Result<()> {
        let mut entries = self.entries.write().expect("names lock poisoned");
        let current = entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !expected_value.is_empty() && current.value != expected_value {
            return Err(RegistryError::PreconditionFailed(name.to_string()));
        }
        entries.remove(name);
        Ok(())
    }
}

/// Disk-backed name registry on top of the durable map. Entries are stored
/// as JSON values keyed by name.
pub struct PersistentNames {
    map: DurableMap,
}

impl PersistentNames {
    /// Open (or initialize) the registry stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: DurableMapConfig) -> Result<Self> {
        Ok(Self {
            map: DurableMap::open(dir, config)?,
        })
    }

    /// The registry's persistent 64-hex id.
    pub fn id(&self) -> String {
        self.map.id().to_string()
    }
}

#[async_trait]
impl NameStore for PersistentNames {
    async fn get(&self, name: &str) -> Result<NameEntry> {
        let raw = self.map.get(name)?;
        serde_json::from_str(&raw)
            .map_err(|e| RegistryError::BadRequest(format!("corrupt name entry: {e}")))
    }

    async fn put(&self, name: &str, value: &str, tokens: &[String]) -> Result<()> {
        let entry = NameEntry {
            value: value.to_string(),
            tokens: tokens.to_vec(),
        };
        let encoded = serde_json::to_string(&entry)
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
        // Upsert: blind-create, then unconditional update when it exists.
        match self.map.create(name, &encoded) {
            Ok(()) => Ok(()),
            Err(invariant_durable::DurableError::Conflict(_)) => {
                let current = self.map.get(name)?;
                Ok(self.map.update(name, &encoded, &current)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str, expected_value: &str) -> Result<()> {
        if expected_value.is_empty() {
            return Ok(self.map.delete(name, "")?);
        }
        let entry = self.get(name).await?;
        if entry.value != expected_value {
            return Err(RegistryError::PreconditionFailed(name.to_string()));
        }
        let raw = self.map.get(name)?;
        Ok(self.map.delete(name, &raw)?)
    }
}

const TXT_PREFIX: &str = "invariant:";

/// Parse the DNS TXT record form `invariant:{value};{token,token}` from a
/// set of TXT strings. Returns the first record carrying the prefix.
pub fn parse_txt_records(records: &[String]) -> Option<NameEntry> {
    for record in records {
        let Some(rest) = record.strip_prefix(TXT_PREFIX) else {
            continue;
        };
        let mut parts = rest.splitn(2, ';');
        let value = parts.next().unwrap_or("");
        if value.is_empty() {
            continue;
        }
        let tokens = match parts.next() {
            Some(t) if !t.is_empty() => t.split(',').map(|s| s.to_string()).collect(),
            _ => Vec::new(),
        };
        return Some(NameEntry {
            value: value.to_string(),
            tokens,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use invariant_durable::DurableMapConfig;
    use tempfile::TempDir;

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn put_get_delete() {
        let names = MemoryNames::new();
        names
            .put("alpha", "value1", &tokens(&["storage-v1"]))
            .await
            .unwrap();
        let entry = names.get("alpha").await.unwrap();
        assert_eq!(entry.value, "value1");
        assert_eq!(entry.tokens, tokens(&["storage-v1"]));

        assert!(matches!(
            names.delete("alpha", "wrong").await,
            Err(RegistryError::PreconditionFailed(_))
        ));
        names.delete("alpha", "value1").await.unwrap();
        assert!(matches!(
            names.get("alpha").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn persistent_names_upsert_and_reopen() {
        let dir = TempDir::new().unwrap();
        let config = DurableMapConfig {
            snapshot_interval: None,
        };
        {
            let names = PersistentNames::open(dir.path(), config.clone()).unwrap();
            names.put("alpha", "v1", &tokens(&["a"])).await.unwrap();
            names.put("alpha", "v2", &tokens(&["a", "b"])).await.unwrap();
        }
        let names = PersistentNames::open(dir.path(), config).unwrap();
        let entry = names.get("alpha").await.unwrap();
        assert_eq!(entry.value, "v2");
        assert_eq!(entry.tokens, tokens(&["a", "b"]));
    }

    #[test]
    fn txt_record_parsing() {
        let entry = parse_txt_records(&[
            "unrelated".to_string(),
            format!("invariant:{};storage-v1,finder-v1", "a".repeat(64)),
        ])
        .unwrap();
        assert_eq!(entry.value, "a".repeat(64));
        assert_eq!(entry.tokens, tokens(&["storage-v1", "finder-v1"]));

        let entry = parse_txt_records(&["invariant:bare-value".to_string()]).unwrap();
        assert_eq!(entry.value, "bare-value");
        assert!(entry.tokens.is_empty());

        assert!(parse_txt_records(&["invariant:".to_string()]).is_none());
        assert!(parse_txt_records(&[]).is_none());
    }
}
