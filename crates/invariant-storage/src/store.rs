//! The storage surface and shared address helpers.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::Result;

/// True if `address` is the canonical wire form: 64 lowercase hex chars.
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 64
        && address
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// SHA-256 of `data` in the canonical address form.
pub fn address_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Wire payload for `POST /storage/fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    /// The block to obtain.
    pub address: String,
    /// The peer id to obtain it from (resolved through discovery).
    pub container: String,
}

/// Content-addressed blob storage.
///
/// Blobs are immutable: storing an address that is already present is a
/// no-op equivalent to success. `get`/`size` answer `None` for absent
/// blobs; errors are reserved for transport or I/O failures.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Is the blob present?
    async fn has(&self, address: &str) -> Result<bool>;
    /// The blob bytes, or `None` if absent.
    async fn get(&self, address: &str) -> Result<Option<Bytes>>;
    /// Store a blob and return its address.
    async fn store(&self, data: Bytes) -> Result<String>;
    /// Store a blob at a known address. Answers `false` when the SHA-256 of
    /// `data` does not match `address`.
    async fn store_at(&self, address: &str, data: Bytes) -> Result<bool>;
    /// The blob size in bytes, or `None` if absent.
    async fn size(&self, address: &str) -> Result<Option<u64>>;
}

/// The new-block feed local stores expose for has-notification pushes.
pub trait BlockFeed {
    /// All addresses currently stored.
    fn list(&self) -> Vec<String>;
    /// Addresses of newly stored blobs. Slow consumers lose entries.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(is_valid_address(&"a1".repeat(32)));
        assert!(!is_valid_address(&"A1".repeat(32)));
        assert!(!is_valid_address(&"a".repeat(63)));
        assert!(!is_valid_address(&"g".repeat(64)));
        assert!(!is_valid_address(""));
    }

    #[test]
    fn address_of_empty_input() {
        assert_eq!(
            address_of(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
