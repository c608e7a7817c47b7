//! On-disk blob store: `<dir>/aa/bb/<address>` shard layout with
//! temp-file-then-rename writes and a persistent identity.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use invariant_registry::identity;

use crate::store::{address_of, BlobStore, BlockFeed};
use crate::Result;

const FEED_CAPACITY: usize = 4096;

/// Blob store persisting each blob as one file, sharded by the first two
/// address byte pairs to keep directories small.
pub struct FsStore {
    base_dir: PathBuf,
    id: String,
    feed: broadcast::Sender<String>,
}

impl FsStore {
    /// Open the store rooted at `base_dir`, creating it (and its identity)
    /// on first use.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        let id = identity::load_or_create(&base_dir)?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self { base_dir, id, feed })
    }

    /// This store's persistent 64-hex id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn blob_path(&self, address: &str) -> PathBuf {
        if address.len() < 4 {
            return self.base_dir.join(address);
        }
        self.base_dir
            .join(&address[0..2])
            .join(&address[2..4])
            .join(address)
    }

    fn write_blob(&self, address: &str, data: &[u8]) -> Result<()> {
        let final_path = self.blob_path(address);
        if final_path.exists() {
            // Immutable: identical content is already in place.
            return Ok(());
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.base_dir.join(format!(".upload-{address}"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &final_path)?;
        let _ = self.feed.send(address.to_string());
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn has(&self, address: &str) -> Result<bool> {
        Ok(self.blob_path(address).exists())
    }

    async fn get(&self, address: &str) -> Result<Option<Bytes>> {
        match fs::read(self.blob_path(address)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, data: Bytes) -> Result<String> {
        let address = address_of(&data);
        self.write_blob(&address, &data)?;
        Ok(address)
    }

    async fn store_at(&self, address: &str, data: Bytes) -> Result<bool> {
        if address_of(&data) != address {
            return Ok(false);
        }
        self.write_blob(address, &data)?;
        Ok(true)
    }

    async fn size(&self, address: &str) -> Result<Option<u64>> {
        match fs::metadata(self.blob_path(address)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlockFeed for FsStore {
    fn list(&self) -> Vec<String> {
        let mut addresses = Vec::new();
        let Ok(shards) = fs::read_dir(&self.base_dir) else {
            return addresses;
        };
        for shard in shards.flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            let Ok(subshards) = fs::read_dir(shard.path()) else {
                continue;
            };
            for subshard in subshards.flatten() {
                let Ok(blobs) = fs::read_dir(subshard.path()) else {
                    continue;
                };
                for blob in blobs.flatten() {
                    let name = blob.file_name().to_string_lossy().into_owned();
                    if crate::store::is_valid_address(&name) {
                        addresses.push(name);
                    }
                }
            }
        }
        addresses
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn blobs_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let addr = {
            let store = FsStore::open(dir.path()).unwrap();
            store.store(Bytes::from_static(b"persistent")).await.unwrap()
        };
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get(&addr).await.unwrap().unwrap(),
            Bytes::from_static(b"persistent")
        );
        assert_eq!(store.size(&addr).await.unwrap(), Some(10));
        assert_eq!(store.list(), vec![addr]);
    }

    #[tokio::test]
    async fn identity_is_persistent() {
        let dir = TempDir::new().unwrap();
        let first = FsStore::open(dir.path()).unwrap().id().to_string();
        let second = FsStore::open(dir.path()).unwrap().id().to_string();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn store_at_rejects_wrong_digest() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let addr = address_of(b"right");
        assert!(!store
            .store_at(&addr, Bytes::from_static(b"wrong"))
            .await
            .unwrap());
        assert!(!store.has(&addr).await.unwrap());
    }

    #[tokio::test]
    async fn blobs_land_in_shard_directories() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let addr = store.store(Bytes::from_static(b"sharded")).await.unwrap();
        let expected = dir
            .path()
            .join(&addr[0..2])
            .join(&addr[2..4])
            .join(&addr);
        assert!(expected.exists());
    }
}
