//! End-to-end preservation pipeline tests.
//!
//! Exercises the full core against real disk-backed tiers and an in-memory
//! SQLite database:
//! - ingest with declared checksums (match and mismatch)
//! - replication with injected transient archive outages
//! - idempotent and concurrent replication requests
//! - scrub-detected fixity drift and remediation

use async_trait::async_trait;
use bytes::Bytes;
use preservation_store::digest::{ByteStream, StreamingDigest};
use preservation_store::errors::{PreservationError, PreservationResult};
use preservation_store::fixity::DeclaredChecksums;
use preservation_store::models::artifact::ArtifactStatus;
use preservation_store::models::event::{EventOutcome, EventType};
use preservation_store::models::location::{StorageTier, VerificationOutcome};
use preservation_store::repo;
use preservation_store::services::preservation_service::{
    IngestRequest, PreservationService, ReplicationPolicy, ReplicationTicket,
};
use preservation_store::services::replication::ReplicationCoordinator;
use preservation_store::storage::{fs::FsStorage, ObjectReader, StorageAdapter};
use sqlx::sqlite::SqlitePoolOptions;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Archive adapter that fails its first `failures` writes with a transient
/// storage error, then behaves normally.
struct FlakyArchive {
    inner: FsStorage,
    remaining_failures: AtomicUsize,
}

impl FlakyArchive {
    fn new(inner: FsStorage, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl StorageAdapter for FlakyArchive {
    async fn put(&self, key: &str, stream: ByteStream) -> PreservationResult<String> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PreservationError::StorageWrite(
                "injected transient archive outage".to_string(),
            ));
        }
        self.inner.put(key, stream).await
    }

    async fn reader(&self, handle: &str) -> PreservationResult<ObjectReader> {
        self.inner.reader(handle).await
    }

    async fn exists(&self, handle: &str) -> PreservationResult<bool> {
        self.inner.exists(handle).await
    }

    async fn delete(&self, handle: &str) -> PreservationResult<()> {
        self.inner.delete(handle).await
    }
}

/// Hot adapter that completes its inner write, then parks until released.
/// Lets a test cancel an ingestion after the hot copy is finalized and
/// visible but before the pipeline has recorded a terminal status.
struct GatedHot {
    inner: FsStorage,
    written: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StorageAdapter for GatedHot {
    async fn put(&self, key: &str, stream: ByteStream) -> PreservationResult<String> {
        let handle = self.inner.put(key, stream).await?;
        self.written.notify_one();
        self.release.notified().await;
        Ok(handle)
    }

    async fn reader(&self, handle: &str) -> PreservationResult<ObjectReader> {
        self.inner.reader(handle).await
    }

    async fn exists(&self, handle: &str) -> PreservationResult<bool> {
        self.inner.exists(handle).await
    }

    async fn delete(&self, handle: &str) -> PreservationResult<()> {
        self.inner.delete(handle).await
    }
}

struct Harness {
    service: PreservationService,
    hot_dir: TempDir,
    archive_dir: TempDir,
}

async fn service_with(
    hot: Arc<dyn StorageAdapter>,
    archive: Arc<dyn StorageAdapter>,
    ingest_timeout: Option<Duration>,
    max_attempts: u32,
) -> PreservationService {
    // One connection: each in-memory SQLite connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    repo::migrate(&pool).await.expect("migrate");
    let db = Arc::new(pool);

    let policy = ReplicationPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        attempt_timeout: Duration::from_secs(5),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let service =
        PreservationService::new(db, hot, archive, policy, ingest_timeout, false, tx);
    ReplicationCoordinator::new(service.clone()).spawn(rx);
    service
}

async fn harness(archive_failures: usize, max_attempts: u32) -> Harness {
    let hot_dir = tempfile::tempdir().expect("hot dir");
    let archive_dir = tempfile::tempdir().expect("archive dir");

    let hot: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new(hot_dir.path()));
    let archive: Arc<dyn StorageAdapter> = Arc::new(FlakyArchive::new(
        FsStorage::new(archive_dir.path()),
        archive_failures,
    ));
    let service = service_with(hot, archive, None, max_attempts).await;

    Harness {
        service,
        hot_dir,
        archive_dir,
    }
}

fn stream_of(chunks: Vec<io::Result<Bytes>>) -> ByteStream {
    Box::pin(futures::stream::iter(chunks))
}

fn payload_stream(payload: &'static [u8]) -> ByteStream {
    stream_of(vec![Ok(Bytes::from_static(payload))])
}

fn sha256_of(payload: &[u8]) -> String {
    let mut state = StreamingDigest::new();
    state.update(payload);
    state.finalize().sha256
}

fn request(filename: &str, declared_sha256: Option<String>) -> IngestRequest {
    IngestRequest {
        filename: filename.to_string(),
        content_type: Some("application/octet-stream".into()),
        declared_size: None,
        declared: DeclaredChecksums {
            md5: None,
            sha256: declared_sha256,
        },
    }
}

async fn wait_for_status(
    service: &PreservationService,
    id: Uuid,
    wanted: ArtifactStatus,
) -> ArtifactStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = service.get_status(id).await.expect("status").status;
        if status == wanted || Instant::now() > deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn count_events(
    events: &[preservation_store::models::event::PreservationEvent],
    event_type: EventType,
) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

const PAYLOAD: &[u8] = b"0123456789";

#[tokio::test]
async fn ingest_with_correct_declared_checksum_reaches_stored() {
    let h = harness(0, 5).await;

    let receipt = h
        .service
        .ingest(
            request("tape.bin", Some(sha256_of(PAYLOAD))),
            payload_stream(PAYLOAD),
        )
        .await
        .expect("ingest");
    assert_eq!(receipt.status, ArtifactStatus::Stored);

    let locations = h
        .service
        .list_locations(receipt.artifact_id)
        .await
        .expect("locations");
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].tier, StorageTier::Hot);
    assert_eq!(locations[0].outcome, VerificationOutcome::Verified);
    assert_eq!(locations[0].digest, sha256_of(PAYLOAD));
    assert_eq!(locations[0].size_bytes, PAYLOAD.len() as i64);

    let events = h
        .service
        .list_events(receipt.artifact_id)
        .await
        .expect("events");
    assert_eq!(count_events(&events, EventType::IngestComplete), 1);
    assert!(events.iter().all(|e| e.outcome == EventOutcome::Success));
    assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    let hot_path = h.hot_dir.path().join(&locations[0].handle);
    assert_eq!(std::fs::read(hot_path).expect("hot copy"), PAYLOAD);
}

#[tokio::test]
async fn wrong_declared_checksum_fails_and_removes_the_copy() {
    let h = harness(0, 5).await;

    let wrong = "0".repeat(64);
    let err = h
        .service
        .ingest(request("tape.bin", Some(wrong)), payload_stream(PAYLOAD))
        .await
        .expect_err("must fail");
    assert!(matches!(err, PreservationError::ChecksumMismatch { .. }));

    // The artifact record survives for forensics, the bytes do not.
    let artifacts = list_artifacts(&h.service).await;
    assert_eq!(artifacts.len(), 1);
    let id = artifacts[0];
    assert_eq!(
        h.service.get_status(id).await.expect("status").status,
        ArtifactStatus::Failed
    );
    assert!(h.service.list_locations(id).await.expect("locations").is_empty());

    let events = h.service.list_events(id).await.expect("events");
    let failures: Vec<_> = events
        .iter()
        .filter(|e| e.outcome == EventOutcome::Failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].event_type, EventType::FixityMismatch);
    assert!(
        failures[0]
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("checksum mismatch")
    );

    // No object file anywhere under the hot root (staging included).
    assert!(!any_file_under(h.hot_dir.path()));
}

#[tokio::test]
async fn broken_stream_publishes_nothing() {
    let h = harness(0, 5).await;

    let err = h
        .service
        .ingest(
            request("tape.bin", None),
            stream_of(vec![
                Ok(Bytes::from_static(b"01234")),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "client gone")),
            ]),
        )
        .await
        .expect_err("must fail");
    assert!(matches!(err, PreservationError::StreamRead(_)));

    let id = list_artifacts(&h.service).await[0];
    assert_eq!(
        h.service.get_status(id).await.expect("status").status,
        ArtifactStatus::Failed
    );
    assert!(h.service.list_locations(id).await.expect("locations").is_empty());
    assert!(!any_file_under(h.hot_dir.path()));
}

#[tokio::test]
async fn cancelled_ingestion_ends_failed_with_no_visible_object() {
    let hot_dir = tempfile::tempdir().expect("hot dir");
    let archive_dir = tempfile::tempdir().expect("archive dir");
    let written = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let hot: Arc<dyn StorageAdapter> = Arc::new(GatedHot {
        inner: FsStorage::new(hot_dir.path()),
        written: written.clone(),
        release: release.clone(),
    });
    let archive: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new(archive_dir.path()));
    let service = service_with(hot, archive, None, 5).await;

    let ingest = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
                .await
        })
    };

    // The hot copy is finalized and visible, but neither Stored nor Failed
    // has been persisted yet. Dropping the task here must not strand the
    // artifact in Uploading with a published object.
    written.notified().await;
    assert!(any_file_under(hot_dir.path()));
    ingest.abort();

    let id = list_artifacts(&service).await[0];
    assert_eq!(
        wait_for_status(&service, id, ArtifactStatus::Failed).await,
        ArtifactStatus::Failed
    );
    assert!(!any_file_under(hot_dir.path()));
    assert!(service.list_locations(id).await.expect("locations").is_empty());

    let events = service.list_events(id).await.expect("events");
    assert!(events.iter().any(|e| {
        e.event_type == EventType::IngestComplete && e.outcome == EventOutcome::Failure
    }));
}

#[tokio::test]
async fn slow_ingestion_times_out_and_fails() {
    let hot_dir = tempfile::tempdir().expect("hot dir");
    let archive_dir = tempfile::tempdir().expect("archive dir");
    let hot: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new(hot_dir.path()));
    let archive: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new(archive_dir.path()));
    let service = service_with(hot, archive, Some(Duration::from_millis(50)), 5).await;

    let stalled: ByteStream = Box::pin(
        futures::stream::iter(vec![Ok(Bytes::from_static(b"partial"))])
            .chain(futures::stream::pending()),
    );
    let err = service
        .ingest(request("tape.bin", None), stalled)
        .await
        .expect_err("must time out");
    assert!(matches!(err, PreservationError::StreamRead(_)));

    let id = list_artifacts(&service).await[0];
    assert_eq!(
        service.get_status(id).await.expect("status").status,
        ArtifactStatus::Failed
    );
    assert!(service.list_locations(id).await.expect("locations").is_empty());
    // Neither a finalized object nor a staging file survives the timeout.
    assert!(!any_file_under(hot_dir.path()));

    let events = service.list_events(id).await.expect("events");
    let failures: Vec<_> = events
        .iter()
        .filter(|e| e.outcome == EventOutcome::Failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].event_type, EventType::IngestComplete);
}

#[tokio::test]
async fn replication_retries_transient_failures_then_archives() {
    let h = harness(2, 5).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;

    let ticket = h.service.trigger_replication(id).await.expect("trigger");
    assert_eq!(ticket, ReplicationTicket::Accepted);

    assert_eq!(
        wait_for_status(&h.service, id, ArtifactStatus::Archived).await,
        ArtifactStatus::Archived
    );

    let events = h.service.list_events(id).await.expect("events");
    assert_eq!(count_events(&events, EventType::ReplicationAttempt), 3);
    assert_eq!(count_events(&events, EventType::ReplicationSuccess), 1);
    assert_eq!(count_events(&events, EventType::ReplicationFailure), 2);

    let locations = h.service.list_locations(id).await.expect("locations");
    let archive_rows: Vec<_> = locations
        .iter()
        .filter(|l| l.tier == StorageTier::Archive)
        .collect();
    assert_eq!(archive_rows.len(), 1);
    assert_eq!(archive_rows[0].outcome, VerificationOutcome::Verified);
    assert_eq!(archive_rows[0].digest, sha256_of(PAYLOAD));

    let archived = std::fs::read(h.archive_dir.path().join(&archive_rows[0].handle))
        .expect("archive copy");
    assert_eq!(archived, PAYLOAD);
}

#[tokio::test]
async fn replication_is_idempotent_once_archived() {
    let h = harness(0, 5).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;

    h.service.trigger_replication(id).await.expect("trigger");
    wait_for_status(&h.service, id, ArtifactStatus::Archived).await;

    let events_before = h.service.list_events(id).await.expect("events");
    let ticket = h.service.trigger_replication(id).await.expect("re-trigger");
    assert_eq!(ticket, ReplicationTicket::AlreadyArchived);

    let events_after = h.service.list_events(id).await.expect("events");
    assert_eq!(events_before.len(), events_after.len());
    assert_eq!(count_events(&events_after, EventType::ReplicationSuccess), 1);

    let archive_rows = h
        .service
        .list_locations(id)
        .await
        .expect("locations")
        .into_iter()
        .filter(|l| l.tier == StorageTier::Archive)
        .count();
    assert_eq!(archive_rows, 1);
}

#[tokio::test]
async fn concurrent_triggers_produce_exactly_one_transfer() {
    let h = harness(0, 5).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        handles.push(tokio::spawn(
            async move { service.trigger_replication(id).await },
        ));
    }
    let mut accepted = 0;
    for handle in handles {
        if handle.await.expect("join").expect("trigger") == ReplicationTicket::Accepted {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);

    wait_for_status(&h.service, id, ArtifactStatus::Archived).await;

    let events = h.service.list_events(id).await.expect("events");
    assert_eq!(count_events(&events, EventType::ReplicationSuccess), 1);
    let archive_rows = h
        .service
        .list_locations(id)
        .await
        .expect("locations")
        .into_iter()
        .filter(|l| l.tier == StorageTier::Archive && l.outcome == VerificationOutcome::Verified)
        .count();
    assert_eq!(archive_rows, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_artifact() {
    let h = harness(usize::MAX, 3).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;

    h.service.trigger_replication(id).await.expect("trigger");
    assert_eq!(
        wait_for_status(&h.service, id, ArtifactStatus::Failed).await,
        ArtifactStatus::Failed
    );

    let events = h.service.list_events(id).await.expect("events");
    assert_eq!(count_events(&events, EventType::ReplicationAttempt), 3);
    assert_eq!(count_events(&events, EventType::ReplicationFailure), 3);
    assert_eq!(count_events(&events, EventType::ReplicationSuccess), 0);
    let last_failure = events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::ReplicationFailure)
        .expect("failure event");
    assert!(
        last_failure
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("retryable=false")
    );

    assert!(
        h.service
            .list_locations(id)
            .await
            .expect("locations")
            .iter()
            .all(|l| l.tier != StorageTier::Archive)
    );
}

#[tokio::test]
async fn replicating_a_failed_artifact_is_rejected() {
    let h = harness(0, 5).await;

    let wrong = "f".repeat(64);
    let _ = h
        .service
        .ingest(request("tape.bin", Some(wrong)), payload_stream(PAYLOAD))
        .await
        .expect_err("ingest fails");
    let id = list_artifacts(&h.service).await[0];

    let err = h
        .service
        .trigger_replication(id)
        .await
        .expect_err("must reject");
    assert!(matches!(
        err,
        PreservationError::InvalidStateTransition { .. }
    ));
}

#[tokio::test]
async fn scrub_detects_archive_drift_and_degrades() {
    let h = harness(0, 5).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;
    h.service.trigger_replication(id).await.expect("trigger");
    wait_for_status(&h.service, id, ArtifactStatus::Archived).await;

    // Bit rot on the archive copy.
    let archive_handle = h
        .service
        .list_locations(id)
        .await
        .expect("locations")
        .into_iter()
        .find(|l| l.tier == StorageTier::Archive)
        .expect("archive row")
        .handle;
    std::fs::write(h.archive_dir.path().join(&archive_handle), b"corrupted").expect("corrupt");

    let report = h.service.scrub(id).await.expect("scrub");
    assert_eq!(report.status, ArtifactStatus::Degraded);
    assert_eq!(report.checks.len(), 2);
    let hot_check = report
        .checks
        .iter()
        .find(|c| c.tier == StorageTier::Hot)
        .expect("hot check");
    assert!(hot_check.matched, "hot copy must be unaffected");
    let archive_check = report
        .checks
        .iter()
        .find(|c| c.tier == StorageTier::Archive)
        .expect("archive check");
    assert!(!archive_check.matched);

    let events = h.service.list_events(id).await.expect("events");
    assert_eq!(count_events(&events, EventType::FixityMismatch), 1);

    // The drifted copy is surfaced, not deleted.
    assert!(h.archive_dir.path().join(&archive_handle).exists());

    // Each re-check appended a fresh location row.
    let locations = h.service.list_locations(id).await.expect("locations");
    assert_eq!(locations.len(), 4);
    assert_eq!(
        locations
            .iter()
            .filter(|l| l.outcome == VerificationOutcome::Mismatch)
            .count(),
        1
    );
}

#[tokio::test]
async fn degraded_artifact_can_be_remediated() {
    let h = harness(0, 5).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;
    h.service.trigger_replication(id).await.expect("trigger");
    wait_for_status(&h.service, id, ArtifactStatus::Archived).await;

    let archive_handle = h
        .service
        .list_locations(id)
        .await
        .expect("locations")
        .into_iter()
        .find(|l| l.tier == StorageTier::Archive)
        .expect("archive row")
        .handle;
    std::fs::write(h.archive_dir.path().join(&archive_handle), b"corrupted").expect("corrupt");
    h.service.scrub(id).await.expect("scrub");

    // Remediation re-kicks replication from the still-good hot copy.
    let ticket = h.service.trigger_replication(id).await.expect("remediate");
    assert_eq!(ticket, ReplicationTicket::Accepted);
    assert_eq!(
        wait_for_status(&h.service, id, ArtifactStatus::Archived).await,
        ArtifactStatus::Archived
    );

    let restored =
        std::fs::read(h.archive_dir.path().join(&archive_handle)).expect("archive copy");
    assert_eq!(restored, PAYLOAD);
}

#[tokio::test]
async fn clean_scrub_keeps_status_and_appends_rows() {
    let h = harness(0, 5).await;

    let receipt = h
        .service
        .ingest(request("tape.bin", None), payload_stream(PAYLOAD))
        .await
        .expect("ingest");
    let id = receipt.artifact_id;
    h.service.trigger_replication(id).await.expect("trigger");
    wait_for_status(&h.service, id, ArtifactStatus::Archived).await;

    let report = h.service.scrub(id).await.expect("scrub");
    assert_eq!(report.status, ArtifactStatus::Archived);
    assert!(report.checks.iter().all(|c| c.matched));

    let locations = h.service.list_locations(id).await.expect("locations");
    assert_eq!(locations.len(), 4);
    assert!(
        locations
            .iter()
            .all(|l| l.outcome == VerificationOutcome::Verified)
    );
}

/// All artifact ids in the store, via the status index of every lifecycle
/// state.
async fn list_artifacts(service: &PreservationService) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for status in [
        ArtifactStatus::Uploading,
        ArtifactStatus::Stored,
        ArtifactStatus::Replicating,
        ArtifactStatus::Archived,
        ArtifactStatus::Degraded,
        ArtifactStatus::Failed,
    ] {
        ids.extend(service.artifacts().ids_with_status(status).await.expect("ids"));
    }
    ids
}

fn any_file_under(root: &std::path::Path) -> bool {
    fn walk(dir: &std::path::Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if walk(&path) {
                    return true;
                }
            } else {
                return true;
            }
        }
        false
    }
    walk(root)
}
