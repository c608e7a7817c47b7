//! Round-trip laws and corruption detection for the content codec.

#![cfg(test)]

use std::fs;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use invariant_content::{read_to_vec, write, Compression, ContentError, KeyPolicy, WriterOptions};
use invariant_storage::{BlobStore, BlockFeed, FsStore, MemoryStore};

fn pseudo_random(len: usize) -> Vec<u8> {
    // xorshift keeps the buffer deterministic across runs.
    let mut state = 0x9e3779b97f4a7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

#[tokio::test]
async fn every_option_combination_roundtrips_multiblock() {
    // 3 MiB forces the block-split path for every combination.
    let data = pseudo_random(3 * 1024 * 1024);
    let expected_digest = hex::encode(Sha256::digest(&data));

    for compress in [
        Compression::None,
        Compression::Inflate,
        Compression::Gzip,
        Compression::Brotli,
    ] {
        for (encrypt, key_policy) in [
            (false, KeyPolicy::PerBlockRandom),
            (true, KeyPolicy::PerBlockRandom),
            (true, KeyPolicy::SharedRandom),
            (true, KeyPolicy::Supplied),
            (true, KeyPolicy::Deterministic),
        ] {
            let opts = WriterOptions {
                compress,
                encrypt,
                key_policy,
                supplied_key: Some([0x11; 32]),
            };
            let store = Arc::new(MemoryStore::new());
            let link = write(&data, store.as_ref(), &opts).await.unwrap();
            assert_eq!(link.expected, expected_digest, "{opts:?}");

            let out = read_to_vec(&link, store as Arc<dyn BlobStore>, None)
                .await
                .unwrap();
            assert_eq!(out, data, "{opts:?}");
        }
    }
}

#[tokio::test]
async fn deterministic_writes_share_every_blob() {
    let data = pseudo_random(3 * 1024 * 1024);
    let opts = WriterOptions {
        compress: Compression::Gzip,
        encrypt: true,
        key_policy: KeyPolicy::Deterministic,
        supplied_key: None,
    };

    let store = MemoryStore::new();
    let first = write(&data, &store, &opts).await.unwrap();
    let count_after_first = store.list().len();
    let second = write(&data, &store, &opts).await.unwrap();

    assert_eq!(first.address, second.address);
    // The second write introduced nothing new.
    assert_eq!(store.list().len(), count_after_first);
}

#[tokio::test]
async fn per_block_random_shares_nothing_but_the_digest() {
    let data = pseudo_random(3 * 1024 * 1024);
    let opts = WriterOptions {
        encrypt: true,
        key_policy: KeyPolicy::PerBlockRandom,
        ..WriterOptions::default()
    };

    let store = MemoryStore::new();
    let first = write(&data, &store, &opts).await.unwrap();
    let second = write(&data, &store, &opts).await.unwrap();

    assert_ne!(first.address, second.address);
    assert_eq!(first.expected, second.expected);
}

#[tokio::test]
async fn flipping_any_blob_byte_fails_the_read() {
    let data = pseudo_random(3 * 1024 * 1024);
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FsStore::open(dir.path()).unwrap());
    let link = write(&data, store.as_ref(), &WriterOptions::default())
        .await
        .unwrap();

    for address in store.list() {
        let path = dir
            .path()
            .join(&address[0..2])
            .join(&address[2..4])
            .join(&address);
        let mut blob = fs::read(&path).unwrap();
        blob[0] ^= 0x01;
        fs::write(&path, &blob).unwrap();

        let result = read_to_vec(
            &link,
            Arc::clone(&store) as Arc<dyn BlobStore>,
            None,
        )
        .await;
        assert!(result.is_err(), "corrupted {address} went unnoticed");

        // Restore for the next iteration.
        blob[0] ^= 0x01;
        fs::write(&path, &blob).unwrap();
    }

    // Pristine tree still reads back in full.
    let out = read_to_vec(&link, store as Arc<dyn BlobStore>, None)
        .await
        .unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn corrupted_leaf_reports_integrity_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FsStore::open(dir.path()).unwrap());
    let link = write(b"small and honest", store.as_ref(), &WriterOptions::default())
        .await
        .unwrap();

    let address = &link.address;
    let path = dir
        .path()
        .join(&address[0..2])
        .join(&address[2..4])
        .join(address);
    let mut blob = fs::read(&path).unwrap();
    blob[3] ^= 0xff;
    fs::write(&path, &blob).unwrap();

    let err = read_to_vec(&link, store as Arc<dyn BlobStore>, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ContentError::Integrity { .. }));
}
