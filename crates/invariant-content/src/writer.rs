//! The write pipeline: chunk → compress → encrypt → store → link.

use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use invariant_storage::BlobStore;

use crate::chunker::{chunk_ranges, SINGLE_BLOCK_MAX};
use crate::cipher::{self, AES_256_CBC, IV_LEN, KEY_LEN};
use crate::compress::compress;
use crate::link::{BlockList, BlockListItem, Compression, ContentLink, Transform};
use crate::{ContentError, Result};

/// Encoded block lists above this size are partitioned and nested.
const BLOCK_LIST_MAX: usize = 2 * 1024 * 1024;

/// Children per partitioned block-list level.
const BLOCK_LIST_FANOUT: usize = 1000;

/// How encryption keys are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    /// A fresh random key per block. The strongest option and the default.
    #[default]
    PerBlockRandom,
    /// One random key shared by every block and block list of the write.
    SharedRandom,
    /// The caller supplies the key.
    Supplied,
    /// `SHA-256(plaintext)` as the key, giving convergent (deduplicating)
    /// encryption. The weakest option: anyone who can guess the plaintext
    /// can confirm it. A deliberate trade-off, chosen explicitly.
    Deterministic,
}

/// Options for a write.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Compression applied to every block.
    pub compress: Compression,
    /// Encrypt blocks with AES-256-CBC.
    pub encrypt: bool,
    /// Key selection when `encrypt` is set.
    pub key_policy: KeyPolicy,
    /// Required 32-byte key for [`KeyPolicy::Supplied`].
    pub supplied_key: Option<[u8; KEY_LEN]>,
}

/// Write `data` through the pipeline into `store` and return the root
/// content link. Streams at or below 1 MiB become a single block; larger
/// streams are split at rolling-hash boundaries and tied together by a
/// (possibly nested) block list.
pub async fn write(
    data: &[u8],
    store: &dyn BlobStore,
    opts: &WriterOptions,
) -> Result<ContentLink> {
    let shared_key = shared_key_for(opts)?;

    if data.len() <= SINGLE_BLOCK_MAX {
        return write_block(data, store, opts, shared_key.as_ref()).await;
    }

    let ranges = chunk_ranges(data);
    debug!(input = data.len(), blocks = ranges.len(), "splitting stream");

    let mut items = Vec::with_capacity(ranges.len());
    for range in ranges {
        let chunk = &data[range];
        let link = write_block(chunk, store, opts, shared_key.as_ref()).await?;
        items.push(BlockListItem {
            content: link,
            size: chunk.len() as u64,
        });
    }

    let mut root = write_block_list(items, store, opts, shared_key.as_ref()).await?;
    // The root carries the digest of the whole plaintext; inner block-list
    // links stay clear and rely on their children.
    root.expected = hex::encode(Sha256::digest(data));
    Ok(root)
}

fn shared_key_for(opts: &WriterOptions) -> Result<Option<[u8; KEY_LEN]>> {
    if !opts.encrypt {
        return Ok(None);
    }
    match opts.key_policy {
        KeyPolicy::SharedRandom => {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            Ok(Some(key))
        }
        KeyPolicy::Supplied => {
            let key = opts.supplied_key.ok_or_else(|| {
                ContentError::Cipher("supplied key policy requires a 32-byte key".to_string())
            })?;
            Ok(Some(key))
        }
        KeyPolicy::PerBlockRandom | KeyPolicy::Deterministic => Ok(None),
    }
}

/// Compress, encrypt and store one block; the returned link's transforms
/// are in reverse-write order so readers apply them front to back.
async fn write_block(
    data: &[u8],
    store: &dyn BlobStore,
    opts: &WriterOptions,
    shared_key: Option<&[u8; KEY_LEN]>,
) -> Result<ContentLink> {
    let mut transforms = Vec::new();
    let mut current = std::borrow::Cow::Borrowed(data);

    if let Some(algorithm) = opts.compress.algorithm() {
        current = std::borrow::Cow::Owned(compress(&current, opts.compress)?);
        transforms.insert(
            0,
            Transform::Decompress {
                algorithm: algorithm.to_string(),
            },
        );
    }

    if opts.encrypt {
        let (key, iv) = block_key_iv(data, opts, shared_key)?;
        current = std::borrow::Cow::Owned(cipher::encrypt(&current, &key, &iv));
        transforms.insert(
            0,
            Transform::Decipher {
                algorithm: AES_256_CBC.to_string(),
                key: hex::encode(key),
                iv: hex::encode(iv),
            },
        );
    }

    let address = store.store(Bytes::copy_from_slice(&current)).await?;

    Ok(ContentLink {
        address,
        slot: false,
        transforms,
        expected: hex::encode(Sha256::digest(data)),
        primary: String::new(),
    })
}

/// Choose the key and iv for one block. The deterministic policy derives
/// both from the plaintext so identical input reproduces identical blobs;
/// every other policy uses a fresh random iv.
fn block_key_iv(
    plaintext: &[u8],
    opts: &WriterOptions,
    shared_key: Option<&[u8; KEY_LEN]>,
) -> Result<([u8; KEY_LEN], [u8; IV_LEN])> {
    if opts.key_policy == KeyPolicy::Deterministic {
        let key: [u8; KEY_LEN] = Sha256::digest(plaintext).into();
        let iv_digest: [u8; 32] = Sha256::digest(key).into();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&iv_digest[..IV_LEN]);
        return Ok((key, iv));
    }

    let key = match (opts.key_policy, shared_key) {
        (KeyPolicy::PerBlockRandom, _) => {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            key
        }
        (KeyPolicy::SharedRandom | KeyPolicy::Supplied, Some(shared)) => *shared,
        (KeyPolicy::SharedRandom | KeyPolicy::Supplied, None) => {
            return Err(ContentError::Cipher(
                "shared key missing for key policy".to_string(),
            ))
        }
        (KeyPolicy::Deterministic, _) => unreachable!("handled above"),
    };

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    Ok((key, iv))
}

/// Store a block list over `items`, partitioning into nested lists of at
/// most [`BLOCK_LIST_FANOUT`] children when the JSON exceeds the blob
/// ceiling. The `Blocks` transform is appended last so it runs after
/// Decipher/Decompress on read; list links carry no expected digest.
async fn write_block_list(
    items: Vec<BlockListItem>,
    store: &dyn BlobStore,
    opts: &WriterOptions,
    shared_key: Option<&[u8; KEY_LEN]>,
) -> Result<ContentLink> {
    let mut items = items;
    loop {
        let encoded = serde_json::to_vec(&BlockList {
            blocks: items.clone(),
        })
        .map_err(|e| ContentError::MalformedBlockList(e.to_string()))?;

        if encoded.len() <= BLOCK_LIST_MAX {
            let mut link = write_block(&encoded, store, opts, shared_key).await?;
            link.transforms.push(Transform::Blocks);
            link.expected = String::new();
            return Ok(link);
        }

        debug!(children = items.len(), "partitioning oversized block list");
        let mut parents = Vec::with_capacity(items.len().div_ceil(BLOCK_LIST_FANOUT));
        for group in items.chunks(BLOCK_LIST_FANOUT) {
            let group_size: u64 = group.iter().map(|item| item.size).sum();
            let encoded_group = serde_json::to_vec(&BlockList {
                blocks: group.to_vec(),
            })
            .map_err(|e| ContentError::MalformedBlockList(e.to_string()))?;
            let mut sub_link = write_block(&encoded_group, store, opts, shared_key).await?;
            sub_link.transforms.push(Transform::Blocks);
            sub_link.expected = String::new();
            parents.push(BlockListItem {
                content: sub_link,
                size: group_size,
            });
        }
        items = parents;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invariant_storage::MemoryStore;

    #[tokio::test]
    async fn single_block_link_shape() {
        let store = MemoryStore::new();
        let link = write(b"hello world", &store, &WriterOptions::default())
            .await
            .unwrap();
        assert!(link.transforms.is_empty());
        assert_eq!(link.expected, hex::encode(Sha256::digest(b"hello world")));
        assert!(store.has(&link.address).await.unwrap());
    }

    #[tokio::test]
    async fn transform_order_is_decipher_then_decompress() {
        let store = MemoryStore::new();
        let opts = WriterOptions {
            compress: Compression::Gzip,
            encrypt: true,
            key_policy: KeyPolicy::Deterministic,
            supplied_key: None,
        };
        let link = write(b"ordered transforms", &store, &opts).await.unwrap();
        assert_eq!(link.transforms.len(), 2);
        assert!(matches!(link.transforms[0], Transform::Decipher { .. }));
        assert!(matches!(link.transforms[1], Transform::Decompress { .. }));
    }

    #[tokio::test]
    async fn supplied_policy_requires_key() {
        let store = MemoryStore::new();
        let opts = WriterOptions {
            encrypt: true,
            key_policy: KeyPolicy::Supplied,
            ..WriterOptions::default()
        };
        assert!(matches!(
            write(b"x", &store, &opts).await,
            Err(ContentError::Cipher(_))
        ));
    }

    #[tokio::test]
    async fn deterministic_policy_reproduces_addresses() {
        let store = MemoryStore::new();
        let opts = WriterOptions {
            compress: Compression::Inflate,
            encrypt: true,
            key_policy: KeyPolicy::Deterministic,
            supplied_key: None,
        };
        let first = write(b"converge on me", &store, &opts).await.unwrap();
        let second = write(b"converge on me", &store, &opts).await.unwrap();
        assert_eq!(first.address, second.address);
    }

    #[tokio::test]
    async fn per_block_random_diverges() {
        let store = MemoryStore::new();
        let opts = WriterOptions {
            encrypt: true,
            key_policy: KeyPolicy::PerBlockRandom,
            ..WriterOptions::default()
        };
        let first = write(b"diverge", &store, &opts).await.unwrap();
        let second = write(b"diverge", &store, &opts).await.unwrap();
        assert_ne!(first.address, second.address);
        assert_eq!(first.expected, second.expected);
    }

    #[tokio::test]
    async fn large_stream_ends_with_blocks_transform() {
        let store = MemoryStore::new();
        let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 249) as u8).collect();
        let link = write(&data, &store, &WriterOptions::default()).await.unwrap();
        assert_eq!(link.transforms.last(), Some(&Transform::Blocks));
        assert_eq!(link.expected, hex::encode(Sha256::digest(&data)));
    }
}
