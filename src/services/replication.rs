//! Replication coordinator.
//!
//! Consumes artifact ids from the replication queue and copies each verified
//! hot-tier artifact into the archive tier. The copy is read back from the
//! archive and re-digested independently — transport-level checksums are not
//! trusted. Transient failures are retried with exponential backoff up to a
//! bounded attempt count; every attempt is its own `replication-attempt`
//! event so the audit trail shows each try, not just the outcome.

use crate::digest::{self, ByteStream};
use crate::errors::{PreservationError, PreservationResult};
use crate::fixity::{self, MatchResult};
use crate::models::{
    artifact::{Artifact, ArtifactStatus},
    event::{EventOutcome, EventType},
    location::{StorageLocation, StorageTier, VerificationOutcome},
};
use crate::services::preservation_service::PreservationService;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

/// Background consumer of the replication queue.
#[derive(Clone)]
pub struct ReplicationCoordinator {
    service: PreservationService,
}

impl ReplicationCoordinator {
    pub fn new(service: PreservationService) -> Self {
        Self { service }
    }

    /// Spawn the queue consumer. Each request runs on its own task; the
    /// per-artifact lock inside `replicate` keeps transfers for one artifact
    /// mutually exclusive while different artifacts proceed in parallel.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<Uuid>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = coordinator.replicate(id).await {
                        warn!(artifact = %id, "replication ended in failure: {err}");
                    }
                });
            }
        })
    }

    /// Drive one artifact to `Archived`, retrying transient failures.
    ///
    /// Holds the artifact's lock for the duration of each attempt and
    /// releases it across backoff sleeps, so status queries and scrubs are
    /// never blocked for a whole retry cycle.
    pub async fn replicate(&self, id: Uuid) -> PreservationResult<()> {
        let policy = self.service.policy().clone();
        let mut delay = policy.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let lock = self.service.locks().lock_for(id);
            let guard = lock.lock().await;

            let artifact = self.service.artifacts().fetch(id).await?;
            match artifact.status {
                ArtifactStatus::Replicating => {}
                ArtifactStatus::Stored | ArtifactStatus::Degraded => {
                    self.service
                        .artifacts()
                        .update_status(id, ArtifactStatus::Replicating)
                        .await?;
                }
                // Another transfer finished while this request waited.
                ArtifactStatus::Archived => return Ok(()),
                status @ (ArtifactStatus::Uploading | ArtifactStatus::Failed) => {
                    return Err(PreservationError::InvalidStateTransition {
                        status,
                        requested: "replicate",
                    });
                }
            }

            self.service
                .events()
                .append(
                    id,
                    EventType::ReplicationAttempt,
                    EventOutcome::Success,
                    Some(format!("attempt {attempt} of {}", policy.max_attempts)),
                )
                .await?;

            match self.copy_and_verify(&artifact).await {
                Ok(location) => {
                    self.service.locations().append(&location).await?;
                    self.service
                        .events()
                        .append(
                            id,
                            EventType::FixityCheck,
                            EventOutcome::Success,
                            Some("archive copy independently verified".to_string()),
                        )
                        .await?;
                    self.service
                        .artifacts()
                        .update_status(id, ArtifactStatus::Archived)
                        .await?;
                    self.service
                        .events()
                        .append(
                            id,
                            EventType::ReplicationSuccess,
                            EventOutcome::Success,
                            Some(format!("archive copy at {}", location.handle)),
                        )
                        .await?;
                    info!(artifact = %id, "archived after {attempt} attempt(s)");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    self.service
                        .events()
                        .append(
                            id,
                            EventType::ReplicationFailure,
                            EventOutcome::Failure,
                            Some(format!("retryable=true attempt {attempt}: {err}")),
                        )
                        .await?;
                    self.service
                        .artifacts()
                        .update_status(id, ArtifactStatus::Stored)
                        .await?;
                    drop(guard);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    let detail = if err.is_transient() {
                        format!("retryable=false: retries exhausted after {attempt} attempts: {err}")
                    } else {
                        format!("retryable=false: {err}")
                    };
                    self.service
                        .events()
                        .append(id, EventType::ReplicationFailure, EventOutcome::Failure, Some(detail))
                        .await?;
                    self.service
                        .artifacts()
                        .update_status(id, ArtifactStatus::Failed)
                        .await?;
                    return Err(err);
                }
            }
        }
    }

    /// One attempt: stream the verified hot copy into the archive tier, read
    /// the archive copy back, and recompute its digest from scratch.
    async fn copy_and_verify(&self, artifact: &Artifact) -> PreservationResult<StorageLocation> {
        let record = artifact.checksum_sha256.clone().ok_or_else(|| {
            PreservationError::ReplicationFatal("artifact has no digest of record".to_string())
        })?;
        let hot_location = self
            .service
            .locations()
            .latest_verified(artifact.id, StorageTier::Hot)
            .await?
            .ok_or_else(|| {
                PreservationError::ReplicationFatal("no verified hot copy to replicate".to_string())
            })?;

        // Always read the stored hot copy, never the original upload stream.
        let reader = self.service.hot().reader(&hot_location.handle).await?;
        let stream: ByteStream = Box::pin(ReaderStream::new(reader));

        let timeout = self.service.policy().attempt_timeout;
        let write = self.service.archive().put(&hot_location.handle, stream);
        let handle = match tokio::time::timeout(timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PreservationError::ReplicationTransient(format!(
                    "archive write timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        let archive_reader = self.service.archive().reader(&handle).await?;
        let digests = digest::digest_reader(archive_reader).await?;

        if digests.size_bytes as i64 != artifact.size_bytes {
            self.discard_bad_copy(&handle).await;
            return Err(PreservationError::ReplicationFatal(format!(
                "archive copy is {} bytes, expected {}",
                digests.size_bytes, artifact.size_bytes
            )));
        }
        if let MatchResult::Mismatch { expected, computed } =
            fixity::verify_copy(&record, &digests.sha256)
        {
            self.discard_bad_copy(&handle).await;
            return Err(PreservationError::ReplicationFatal(format!(
                "post-copy fixity mismatch: expected {expected}, computed {computed}"
            )));
        }

        Ok(StorageLocation {
            id: Uuid::new_v4(),
            artifact_id: artifact.id,
            tier: StorageTier::Archive,
            handle,
            digest: digests.sha256,
            size_bytes: digests.size_bytes as i64,
            outcome: VerificationOutcome::Verified,
            verified_at: Utc::now(),
        })
    }

    /// A corrupt archive copy must not linger under the final key where it
    /// could be mistaken for a preserved replica.
    async fn discard_bad_copy(&self, handle: &str) {
        if let Err(err) = self.service.archive().delete(handle).await {
            warn!("failed to remove corrupt archive copy {handle}: {err}");
        }
    }
}
