//! Digest engine: single-pass, multi-algorithm, bounded memory.
//!
//! All digests are computed incrementally while bytes flow through, so a
//! 20 GB stream costs the same fixed buffer as a 10-byte one. Two algorithms
//! run in the same pass: MD5 (fast, legacy fixity records) and SHA-256 (the
//! cryptographic digest of record).

use crate::errors::{PreservationError, PreservationResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Chunk buffer used when digesting from a reader. Independent of total
/// stream length.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// The boxed byte-stream type the core passes across its seams.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Final digests for one complete stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestSet {
    /// Hex-encoded MD5.
    pub md5: String,
    /// Hex-encoded SHA-256.
    pub sha256: String,
    /// Total bytes digested.
    pub size_bytes: u64,
}

/// Incremental state for all supported algorithms.
pub struct StreamingDigest {
    md5: md5::Context,
    sha256: Sha256,
    size_bytes: u64,
}

impl Default for StreamingDigest {
    fn default() -> Self {
        Self {
            md5: md5::Context::new(),
            sha256: Sha256::new(),
            size_bytes: 0,
        }
    }
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk into every algorithm.
    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.consume(chunk);
        self.sha256.update(chunk);
        self.size_bytes += chunk.len() as u64;
    }

    /// Consume the state and produce the final digests.
    pub fn finalize(self) -> DigestSet {
        DigestSet {
            md5: format!("{:x}", self.md5.compute()),
            sha256: hex::encode(self.sha256.finalize()),
            size_bytes: self.size_bytes,
        }
    }
}

/// Shared digest state that observes a stream while something else consumes
/// it, so the storage write and the digest computation happen in one pass.
#[derive(Clone, Default)]
pub struct SharedDigest(Arc<Mutex<StreamingDigest>>);

impl SharedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a stream so every `Ok` chunk is fed into the digest state before
    /// being yielded downstream. Error items pass through untouched.
    pub fn observe(&self, stream: ByteStream) -> ByteStream {
        let state = Arc::clone(&self.0);
        Box::pin(stream.map(move |item| {
            if let Ok(chunk) = &item {
                let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
                guard.update(chunk);
            }
            item
        }))
    }

    /// Take the accumulated state and finalize it. Only meaningful after the
    /// observed stream has been fully consumed; partial digests from an
    /// aborted stream must be discarded by the caller, never finalized.
    pub fn finalize(&self) -> DigestSet {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard).finalize()
    }
}

/// Digest an `AsyncRead` to completion using a fixed-size chunk buffer.
///
/// Used for independent re-verification of stored copies: the bytes are read
/// back from the tier itself, never trusted from a transport-level checksum.
pub async fn digest_reader<R>(mut reader: R) -> PreservationResult<DigestSet>
where
    R: AsyncRead + Unpin,
{
    let mut state = StreamingDigest::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|err| PreservationError::StreamRead(err.to_string()))?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
    }
    Ok(state.finalize())
}
