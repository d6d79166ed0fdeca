//! Storage adapter abstraction over the hot and archive tiers.
//!
//! The core only ever talks to a tier through this trait; concrete backends
//! are collaborators wired in at construction. Writes are atomic from the
//! caller's perspective: a `put` either fully succeeds or leaves no visible
//! object under the final key.

use crate::digest::ByteStream;
use crate::errors::PreservationResult;
use async_trait::async_trait;
use tokio::io::AsyncRead;

pub mod fs;

/// Opened read handle for a stored object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// One storage tier's backend.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Stream an object into the tier under `key`. Returns an opaque location
    /// handle. On failure no partial object is visible under `key`.
    async fn put(&self, key: &str, stream: ByteStream) -> PreservationResult<String>;

    /// Open the object at `handle` for streaming reads.
    async fn reader(&self, handle: &str) -> PreservationResult<ObjectReader>;

    /// Whether an object exists at `handle`.
    async fn exists(&self, handle: &str) -> PreservationResult<bool>;

    /// Remove the object at `handle`. Removing a missing object is not an
    /// error.
    async fn delete(&self, handle: &str) -> PreservationResult<()>;
}
