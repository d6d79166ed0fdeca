//! Disk-backed storage adapter.
//!
//! Payloads live beneath a per-tier base directory. Writes stream into a
//! dot-prefixed staging file and are renamed into place only after a
//! successful flush + fsync, so a half-written object is never visible
//! under its final key.

use crate::digest::ByteStream;
use crate::errors::{PreservationError, PreservationResult};
use crate::storage::{ObjectReader, StorageAdapter};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;

/// Filesystem adapter for one tier.
#[derive(Clone, Debug)]
pub struct FsStorage {
    base_path: PathBuf,
}

impl FsStorage {
    /// Create an adapter rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects empty keys, keys that begin with `/`, and keys containing
    /// `..`, control characters, or backslashes.
    fn ensure_key_safe(key: &str) -> PreservationResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(PreservationError::InvalidKey(key.to_string()));
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(PreservationError::InvalidKey(key.to_string()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(PreservationError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

/// Removes the staging file on drop unless the rename into place committed
/// it. Covers error returns and dropped `put` futures alike, so a timed-out
/// or cancelled write never leaks a `.tmp-` file under the tier root.
struct StagedFile {
    path: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != ErrorKind::NotFound {
                    debug!(
                        "failed to remove staging file {}: {}",
                        self.path.display(),
                        err
                    );
                }
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn put(&self, key: &str, mut stream: ByteStream) -> PreservationResult<String> {
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| PreservationError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| PreservationError::StorageWrite(err.to_string()))?;

        let staged = StagedFile::new(parent.join(format!(".tmp-{}", Uuid::new_v4())));
        let mut file = File::create(staged.path())
            .await
            .map_err(|err| PreservationError::StorageWrite(err.to_string()))?;

        while let Some(chunk_res) = stream.next().await {
            let chunk =
                chunk_res.map_err(|err| PreservationError::StreamRead(err.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|err| PreservationError::StorageWrite(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| PreservationError::StorageWrite(err.to_string()))?;
        file.sync_all()
            .await
            .map_err(|err| PreservationError::StorageWrite(err.to_string()))?;
        drop(file);

        fs::rename(staged.path(), &file_path)
            .await
            .map_err(|err| PreservationError::StorageWrite(err.to_string()))?;
        staged.commit();

        Ok(key.to_string())
    }

    async fn reader(&self, handle: &str) -> PreservationResult<ObjectReader> {
        Self::ensure_key_safe(handle)?;
        let file = File::open(self.object_path(handle)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                PreservationError::StorageWrite(format!("object `{}` not found", handle))
            } else {
                PreservationError::Io(err)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn exists(&self, handle: &str) -> PreservationResult<bool> {
        Self::ensure_key_safe(handle)?;
        match fs::metadata(self.object_path(handle)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PreservationError::Io(err)),
        }
    }

    async fn delete(&self, handle: &str) -> PreservationResult<()> {
        Self::ensure_key_safe(handle)?;
        let path = self.object_path(handle);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed object {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object {} already missing", path.display());
            }
            Err(err) => return Err(PreservationError::Io(err)),
        }
        Ok(())
    }
}
