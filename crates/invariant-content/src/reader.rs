//! The read pipeline: resolve, fetch, untransform, verify.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use invariant_registry::SlotStore;
use invariant_storage::BlobStore;

use crate::cipher::{self, AES_256_CBC};
use crate::compress::decompress;
use crate::link::{BlockList, ContentLink, Transform};
use crate::{ContentError, Result};

/// Open a stream over the content behind `link`. Blobs behind a `Blocks`
/// transform are fetched lazily, depth-first, left to right; when the link
/// carries an expected digest, a running SHA-256 is checked at end of
/// stream and a mismatch fails the read.
pub async fn read(
    link: &ContentLink,
    store: Arc<dyn BlobStore>,
    slots: Option<Arc<dyn SlotStore>>,
) -> Result<ContentStream> {
    build_stream(link.clone(), store, slots).await
}

/// Read the whole stream into memory.
pub async fn read_to_vec(
    link: &ContentLink,
    store: Arc<dyn BlobStore>,
    slots: Option<Arc<dyn SlotStore>>,
) -> Result<Vec<u8>> {
    let mut stream = read(link, store, slots).await?;
    stream.read_to_end().await
}

enum StreamState {
    /// Remaining bytes of a fully materialized stream.
    Buffer(Option<Bytes>),
    /// Children of a block list, materialized one at a time.
    Blocks {
        pending: VecDeque<ContentLink>,
        current: Option<Box<ContentStream>>,
    },
    Done,
}

/// A lazy reader over reconstructed content. Errors are terminal: after a
/// failure every subsequent read answers [`ContentError::StreamFailed`].
pub struct ContentStream {
    store: Arc<dyn BlobStore>,
    slots: Option<Arc<dyn SlotStore>>,
    state: StreamState,
    digest: Option<(Sha256, String)>,
    failed: bool,
}

impl ContentStream {
    /// The next chunk of plaintext, or `None` at end of stream. The final
    /// call performs the digest check when an expected hash is present.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.failed {
            return Err(ContentError::StreamFailed);
        }
        match self.advance().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.failed = true;
                self.state = StreamState::Done;
                Err(e)
            }
        }
    }

    /// Drain the stream into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Type-erased `next_chunk`, breaking the otherwise infinitely sized
    /// future a nested block list would produce.
    fn next_chunk_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send + '_>> {
        Box::pin(self.next_chunk())
    }

    async fn advance(&mut self) -> Result<Option<Bytes>> {
        loop {
            match &mut self.state {
                StreamState::Buffer(bytes) => {
                    if let Some(chunk) = bytes.take() {
                        self.observe(&chunk);
                        return Ok(Some(chunk));
                    }
                    self.state = StreamState::Done;
                    self.check_digest()?;
                    return Ok(None);
                }
                StreamState::Blocks { pending, current } => {
                    if let Some(stream) = current {
                        // Child digests are checked by the child itself.
                        if let Some(chunk) = stream.next_chunk_boxed().await? {
                            self.observe(&chunk);
                            return Ok(Some(chunk));
                        }
                        *current = None;
                        continue;
                    }
                    let Some(child) = pending.pop_front() else {
                        self.state = StreamState::Done;
                        self.check_digest()?;
                        return Ok(None);
                    };
                    let stream =
                        build_stream(child, Arc::clone(&self.store), self.slots.clone()).await?;
                    *current = Some(Box::new(stream));
                }
                StreamState::Done => {
                    return Ok(None);
                }
            }
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        if let Some((hasher, _)) = &mut self.digest {
            hasher.update(chunk);
        }
    }

    fn check_digest(&mut self) -> Result<()> {
        let Some((hasher, expected)) = self.digest.take() else {
            return Ok(());
        };
        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            return Err(ContentError::Integrity { expected, actual });
        }
        Ok(())
    }
}

/// Resolve the link (through the slot registry when flagged), fetch the
/// blob, and apply the transforms in listed order. Returns a boxed future
/// because block lists recurse through child streams.
fn build_stream(
    link: ContentLink,
    store: Arc<dyn BlobStore>,
    slots: Option<Arc<dyn SlotStore>>,
) -> Pin<Box<dyn Future<Output = Result<ContentStream>> + Send>> {
    Box::pin(async move {
        let address = if link.slot {
            let slot_store = slots.as_ref().ok_or(ContentError::SlotServiceMissing)?;
            slot_store
                .get(&link.address)
                .await
                .map_err(|e| ContentError::Slot(format!("slot {}: {e}", link.address)))?
        } else {
            link.address.clone()
        };

        let blob = store
            .get(&address)
            .await?
            .ok_or_else(|| ContentError::BlockNotFound(address.clone()))?;

        let mut buffer: Vec<u8> = blob.to_vec();
        let mut state: Option<StreamState> = None;

        for transform in &link.transforms {
            // A transform after Blocks applies to the concatenation, so the
            // children must be materialized first.
            if matches!(state, Some(StreamState::Blocks { .. })) {
                let mut stream = ContentStream {
                    store: Arc::clone(&store),
                    slots: slots.clone(),
                    state: state.take().expect("state checked above"),
                    digest: None,
                    failed: false,
                };
                buffer = stream.read_to_end().await?;
            }

            match transform {
                Transform::Decipher { algorithm, key, iv } => {
                    if algorithm != AES_256_CBC {
                        return Err(ContentError::UnsupportedTransform(format!(
                            "Decipher {algorithm}"
                        )));
                    }
                    let (key, iv) = cipher::decode_key_iv(key, iv)?;
                    buffer = cipher::decrypt(&buffer, &key, &iv)?;
                }
                Transform::Decompress { algorithm } => {
                    buffer = decompress(&buffer, algorithm)?;
                }
                Transform::Blocks => {
                    let list: BlockList = serde_json::from_slice(&buffer)
                        .map_err(|e| ContentError::MalformedBlockList(e.to_string()))?;
                    // The slot flag is only meaningful on a root link.
                    let pending = list
                        .blocks
                        .into_iter()
                        .map(|item| ContentLink {
                            slot: false,
                            ..item.content
                        })
                        .collect();
                    state = Some(StreamState::Blocks {
                        pending,
                        current: None,
                    });
                }
            }
        }

        let state = state.unwrap_or(StreamState::Buffer(Some(Bytes::from(buffer))));
        let digest = if link.expected.is_empty() {
            None
        } else {
            Some((Sha256::new(), link.expected.clone()))
        };

        Ok(ContentStream {
            store,
            slots,
            state,
            digest,
            failed: false,
        })
    })
}
