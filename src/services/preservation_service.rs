//! PreservationService — the artifact state machine.
//!
//! Owns artifact records and drives every lifecycle transition:
//! `Uploading → Stored → Replicating → Archived`, `Failed` from any
//! non-terminal state, `Archived → Degraded` on scrub drift, and the
//! remediation edge `Degraded → Replicating`. All transitions for one
//! artifact are serialized behind a per-artifact async mutex; different
//! artifacts proceed fully in parallel.

use crate::digest::{self, ByteStream, SharedDigest};
use crate::errors::{PreservationError, PreservationResult};
use crate::fixity::{self, DeclaredChecksums};
use crate::models::{
    artifact::{Artifact, ArtifactStatus},
    event::{EventOutcome, EventType},
    location::{StorageLocation, StorageTier, VerificationOutcome},
};
use crate::repo::{ArtifactRepo, EventRepo, LocationRepo};
use crate::storage::{ObjectReader, StorageAdapter};
use chrono::{Datelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

/// Per-artifact mutual exclusion. Guards state transitions and guarantees
/// at most one in-flight replication transfer per artifact.
#[derive(Clone, Default)]
pub struct ArtifactLocks(Arc<StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>);

impl ArtifactLocks {
    pub fn lock_for(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(id).or_default())
    }
}

/// Retry policy for the replication coordinator.
#[derive(Clone, Debug)]
pub struct ReplicationPolicy {
    /// Bounded attempt count, including the first try.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubled after each failure.
    pub initial_backoff: Duration,
    /// Timeout applied to each archive-tier write.
    pub attempt_timeout: Duration,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(3600),
        }
    }
}

/// Caller-supplied description of an artifact being ingested.
#[derive(Clone, Debug, Default)]
pub struct IngestRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub declared_size: Option<i64>,
    pub declared: DeclaredChecksums,
}

/// What `ingest` returns: the new artifact id and the status it reached.
#[derive(Clone, Debug, Serialize)]
pub struct IngestReceipt {
    pub artifact_id: Uuid,
    pub status: ArtifactStatus,
}

/// Outcome of a replication request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationTicket {
    Accepted,
    AlreadyInProgress,
    AlreadyArchived,
}

/// One tier's result within a scrub.
#[derive(Clone, Debug, Serialize)]
pub struct TierCheck {
    pub tier: StorageTier,
    pub handle: String,
    pub matched: bool,
    pub expected: String,
    pub computed: String,
}

/// Result of re-verifying every stored copy of an artifact.
#[derive(Clone, Debug, Serialize)]
pub struct ScrubReport {
    pub artifact_id: Uuid,
    pub status: ArtifactStatus,
    pub checks: Vec<TierCheck>,
}

/// The preservation core. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct PreservationService {
    artifacts: ArtifactRepo,
    locations: LocationRepo,
    events: EventRepo,
    hot: Arc<dyn StorageAdapter>,
    archive: Arc<dyn StorageAdapter>,
    locks: ArtifactLocks,
    policy: ReplicationPolicy,
    ingest_timeout: Option<Duration>,
    auto_replicate: bool,
    replication_tx: mpsc::UnboundedSender<Uuid>,
}

impl PreservationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SqlitePool>,
        hot: Arc<dyn StorageAdapter>,
        archive: Arc<dyn StorageAdapter>,
        policy: ReplicationPolicy,
        ingest_timeout: Option<Duration>,
        auto_replicate: bool,
        replication_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            artifacts: ArtifactRepo::new(db.clone()),
            locations: LocationRepo::new(db.clone()),
            events: EventRepo::new(db),
            hot,
            archive,
            locks: ArtifactLocks::default(),
            policy,
            ingest_timeout,
            auto_replicate,
            replication_tx,
        }
    }

    pub fn artifacts(&self) -> &ArtifactRepo {
        &self.artifacts
    }

    pub fn locations(&self) -> &LocationRepo {
        &self.locations
    }

    pub fn events(&self) -> &EventRepo {
        &self.events
    }

    pub fn locks(&self) -> &ArtifactLocks {
        &self.locks
    }

    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    pub fn hot(&self) -> &Arc<dyn StorageAdapter> {
        &self.hot
    }

    pub fn archive(&self) -> &Arc<dyn StorageAdapter> {
        &self.archive
    }

    /// Storage key for an artifact's payload, identical on both tiers.
    /// Year/month partitioning keeps directory fan-out manageable.
    fn storage_key(artifact: &Artifact) -> String {
        format!(
            "artifacts/{}/{:02}/{}/{}",
            artifact.created_at.year(),
            artifact.created_at.month(),
            artifact.id,
            artifact.filename
        )
    }

    /// Ingest one artifact from a byte stream.
    ///
    /// Digests are computed inline while the stream is written to the hot
    /// tier — one pass, bounded memory. The artifact reaches `Stored` only
    /// after the hot write succeeded and the computed digests matched
    /// whatever the caller declared. Any failure leaves the artifact
    /// `Failed` with no visible hot-tier object and a permanent failure
    /// event.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        stream: ByteStream,
    ) -> PreservationResult<IngestReceipt> {
        let now = Utc::now();
        let artifact = Artifact {
            id: Uuid::new_v4(),
            filename: request.filename.clone(),
            content_type: request.content_type.clone(),
            declared_size: request.declared_size,
            declared_md5: request.declared.md5.clone(),
            declared_sha256: request.declared.sha256.clone(),
            checksum_md5: None,
            checksum_sha256: None,
            size_bytes: 0,
            status: ArtifactStatus::Uploading,
            created_at: now,
            updated_at: now,
        };
        let id = artifact.id;
        self.artifacts.insert(&artifact).await?;
        self.events
            .append(
                id,
                EventType::IngestStart,
                EventOutcome::Success,
                Some(format!("filename={}", request.filename)),
            )
            .await?;

        let key = Self::storage_key(&artifact);

        // If this future is dropped (client disconnect) before a terminal
        // status has been persisted, the guard marks the artifact Failed and
        // removes any hot copy already finalized under the storage key. It
        // stays armed across every await below until `Stored` or `Failed`
        // is durable.
        let mut guard = IngestGuard::arm(self.clone(), id, key.clone());

        let shared = SharedDigest::new();
        let observed = shared.observe(stream);
        let write = self.hot.put(&key, observed);
        let written = match self.ingest_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(PreservationError::StreamRead(format!(
                    "inbound stream timed out after {}s",
                    limit.as_secs()
                ))),
            },
            None => write.await,
        };

        let handle = match written {
            Ok(handle) => handle,
            Err(err) => {
                let failed = self.fail_ingest(id, None, err).await;
                guard.disarm();
                return failed;
            }
        };

        let digests = shared.finalize();
        self.events
            .append(
                id,
                EventType::StorageWrite,
                EventOutcome::Success,
                Some(format!("hot tier write complete: {handle}")),
            )
            .await?;
        self.artifacts
            .record_digests(id, &digests.md5, &digests.sha256, digests.size_bytes as i64)
            .await?;

        if let Some(declared_size) = request.declared_size {
            if declared_size >= 0 && declared_size as u64 != digests.size_bytes {
                let err = PreservationError::StreamRead(format!(
                    "declared size {declared_size} but received {} bytes",
                    digests.size_bytes
                ));
                let failed = self.fail_ingest(id, Some(&handle), err).await;
                guard.disarm();
                return failed;
            }
        }

        if let Err(err) = fixity::verify_declared(&digests, &request.declared) {
            // The unverified bytes are not kept as a false preserved copy;
            // the event log retains the forensic record.
            if let Err(delete_err) = self.hot.delete(&handle).await {
                warn!(artifact = %id, "failed to remove mismatched hot copy: {delete_err}");
            }
            self.events
                .append(
                    id,
                    EventType::FixityMismatch,
                    EventOutcome::Failure,
                    Some(err.to_string()),
                )
                .await?;
            self.artifacts
                .update_status(id, ArtifactStatus::Failed)
                .await?;
            guard.disarm();
            return Err(err);
        }

        self.events
            .append(
                id,
                EventType::FixityCheck,
                EventOutcome::Success,
                Some(format!("sha256={}", digests.sha256)),
            )
            .await?;
        self.locations
            .append(&StorageLocation {
                id: Uuid::new_v4(),
                artifact_id: id,
                tier: StorageTier::Hot,
                handle: handle.clone(),
                digest: digests.sha256.clone(),
                size_bytes: digests.size_bytes as i64,
                outcome: VerificationOutcome::Verified,
                verified_at: Utc::now(),
            })
            .await?;
        self.artifacts
            .update_status(id, ArtifactStatus::Stored)
            .await?;
        // Terminal decision is durable; a drop past this point is harmless.
        guard.disarm();
        self.events
            .append(
                id,
                EventType::IngestComplete,
                EventOutcome::Success,
                Some(format!("{} bytes stored at {handle}", digests.size_bytes)),
            )
            .await?;

        if self.auto_replicate {
            if let Err(err) = self.trigger_replication(id).await {
                warn!(artifact = %id, "auto-replication enqueue failed: {err}");
            }
        }

        let status = self.artifacts.fetch(id).await?.status;
        Ok(IngestReceipt {
            artifact_id: id,
            status,
        })
    }

    /// Mark an ingest as failed, clean up any finalized hot object, and
    /// surface the original error.
    async fn fail_ingest(
        &self,
        id: Uuid,
        handle: Option<&str>,
        err: PreservationError,
    ) -> PreservationResult<IngestReceipt> {
        if let Some(handle) = handle {
            if let Err(delete_err) = self.hot.delete(handle).await {
                warn!(artifact = %id, "failed to remove hot copy after error: {delete_err}");
            }
        }
        self.events
            .append(
                id,
                EventType::IngestComplete,
                EventOutcome::Failure,
                Some(err.to_string()),
            )
            .await?;
        self.artifacts
            .update_status(id, ArtifactStatus::Failed)
            .await?;
        Err(err)
    }

    /// Current status and last-updated timestamp.
    pub async fn get_status(&self, id: Uuid) -> PreservationResult<Artifact> {
        self.artifacts.fetch(id).await
    }

    /// All location rows for an artifact, oldest first.
    pub async fn list_locations(&self, id: Uuid) -> PreservationResult<Vec<StorageLocation>> {
        self.artifacts.fetch(id).await?;
        self.locations.list(id).await
    }

    /// Full ordered event history for an artifact.
    pub async fn list_events(
        &self,
        id: Uuid,
    ) -> PreservationResult<Vec<crate::models::event::PreservationEvent>> {
        self.artifacts.fetch(id).await?;
        self.events.list(id).await
    }

    /// Open the verified hot copy for streaming reads.
    pub async fn open_content(&self, id: Uuid) -> PreservationResult<(Artifact, ObjectReader)> {
        let artifact = self.artifacts.fetch(id).await?;
        let location = self
            .locations
            .latest_verified(id, StorageTier::Hot)
            .await?
            .ok_or(PreservationError::InvalidStateTransition {
                status: artifact.status,
                requested: "read content of",
            })?;
        let reader = self.hot.reader(&location.handle).await?;
        Ok((artifact, reader))
    }

    /// Request replication into the archive tier.
    ///
    /// Idempotent: re-requesting on an artifact already `Replicating` or
    /// `Archived` is a no-op reporting the current state, not a new
    /// transfer. Requests on `Uploading`/`Failed` artifacts are illegal.
    pub async fn trigger_replication(&self, id: Uuid) -> PreservationResult<ReplicationTicket> {
        let lock = self.locks.lock_for(id);
        let _guard = lock.lock().await;

        let artifact = self.artifacts.fetch(id).await?;
        match artifact.status {
            ArtifactStatus::Stored | ArtifactStatus::Degraded => {
                self.artifacts
                    .update_status(id, ArtifactStatus::Replicating)
                    .await?;
                if self.replication_tx.send(id).is_err() {
                    warn!(artifact = %id, "replication queue receiver is gone");
                }
                Ok(ReplicationTicket::Accepted)
            }
            ArtifactStatus::Replicating => Ok(ReplicationTicket::AlreadyInProgress),
            ArtifactStatus::Archived => Ok(ReplicationTicket::AlreadyArchived),
            status @ (ArtifactStatus::Uploading | ArtifactStatus::Failed) => {
                Err(PreservationError::InvalidStateTransition {
                    status,
                    requested: "replicate",
                })
            }
        }
    }

    /// Revert artifacts stranded in `Replicating` by a crash and re-enqueue
    /// them. Called once at startup.
    pub async fn requeue_interrupted(&self) -> PreservationResult<usize> {
        let stranded = self
            .artifacts
            .ids_with_status(ArtifactStatus::Replicating)
            .await?;
        for &id in &stranded {
            info!(artifact = %id, "requeueing replication interrupted by restart");
            self.artifacts
                .update_status(id, ArtifactStatus::Stored)
                .await?;
            self.trigger_replication(id).await?;
        }
        Ok(stranded.len())
    }

    /// Re-verify every stored copy against the digest of record.
    ///
    /// Each re-check appends a fresh `StorageLocation` row. Drift moves the
    /// artifact to `Degraded` and is logged as a permanent failure event;
    /// the drifted copy is deliberately not deleted — it is the object
    /// under investigation.
    pub async fn scrub(&self, id: Uuid) -> PreservationResult<ScrubReport> {
        let lock = self.locks.lock_for(id);
        let _guard = lock.lock().await;

        let artifact = self.artifacts.fetch(id).await?;
        if !matches!(
            artifact.status,
            ArtifactStatus::Stored | ArtifactStatus::Archived | ArtifactStatus::Degraded
        ) {
            return Err(PreservationError::InvalidStateTransition {
                status: artifact.status,
                requested: "scrub",
            });
        }
        let record = artifact.checksum_sha256.clone().ok_or_else(|| {
            PreservationError::FixityDrift {
                tier: StorageTier::Hot,
                expected: "<missing digest of record>".into(),
                computed: String::new(),
            }
        })?;

        let tiers: [(StorageTier, &Arc<dyn StorageAdapter>); 2] = [
            (StorageTier::Hot, &self.hot),
            (StorageTier::Archive, &self.archive),
        ];

        let mut checks = Vec::new();
        let mut drifted = false;
        for (tier, adapter) in tiers {
            let Some(location) = self.locations.latest_verified(id, tier).await? else {
                continue;
            };
            let reader = adapter.reader(&location.handle).await?;
            let digests = digest::digest_reader(reader).await?;
            let result = fixity::verify_copy(&record, &digests.sha256);
            let matched = result.is_match();

            self.locations
                .append(&StorageLocation {
                    id: Uuid::new_v4(),
                    artifact_id: id,
                    tier,
                    handle: location.handle.clone(),
                    digest: digests.sha256.clone(),
                    size_bytes: digests.size_bytes as i64,
                    outcome: if matched {
                        VerificationOutcome::Verified
                    } else {
                        VerificationOutcome::Mismatch
                    },
                    verified_at: Utc::now(),
                })
                .await?;

            if matched {
                self.events
                    .append(
                        id,
                        EventType::FixityCheck,
                        EventOutcome::Success,
                        Some(format!("scrub: {tier} copy verified")),
                    )
                    .await?;
            } else {
                drifted = true;
                let drift = fixity::drift_error(tier, &record, &digests.sha256);
                self.events
                    .append(
                        id,
                        EventType::FixityMismatch,
                        EventOutcome::Failure,
                        Some(drift.to_string()),
                    )
                    .await?;
            }

            checks.push(TierCheck {
                tier,
                handle: location.handle,
                matched,
                expected: record.clone(),
                computed: digests.sha256,
            });
        }

        let status = if drifted {
            self.artifacts
                .update_status(id, ArtifactStatus::Degraded)
                .await?;
            ArtifactStatus::Degraded
        } else {
            artifact.status
        };

        Ok(ScrubReport {
            artifact_id: id,
            status,
            checks,
        })
    }

    /// Best-effort cleanup for a cancelled ingest. Invoked from the drop
    /// guard, off the cancelled task. Removes whatever landed under the
    /// storage key so no unverified object stays visible, then records the
    /// failure.
    async fn abort_ingest(self, id: Uuid, key: String) {
        if let Err(err) = self.hot.delete(&key).await {
            warn!(artifact = %id, "failed to remove hot copy after cancellation: {err}");
        }
        if let Err(err) = self
            .events
            .append(
                id,
                EventType::IngestComplete,
                EventOutcome::Failure,
                Some("ingestion cancelled before completion".to_string()),
            )
            .await
        {
            warn!(artifact = %id, "failed to record cancellation event: {err}");
        }
        if let Err(err) = self.artifacts.update_status(id, ArtifactStatus::Failed).await {
            warn!(artifact = %id, "failed to mark cancelled ingest as failed: {err}");
        }
    }
}

/// Marks an artifact `Failed` and removes its hot-tier copy if the ingest
/// future is dropped before a terminal status was persisted.
struct IngestGuard {
    service: Option<PreservationService>,
    id: Uuid,
    key: String,
}

impl IngestGuard {
    fn arm(service: PreservationService, id: Uuid, key: String) -> Self {
        Self {
            service: Some(service),
            id,
            key,
        }
    }

    fn disarm(&mut self) {
        self.service = None;
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        if let Some(service) = self.service.take() {
            let id = self.id;
            let key = std::mem::take(&mut self.key);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(service.abort_ingest(id, key));
            }
        }
    }
}
