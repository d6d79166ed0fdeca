//! Typed repositories over SQLite.
//!
//! One repository per entity — artifacts, storage locations, preservation
//! events — each with a narrow read/append surface. Locations and events are
//! append-only with respect to an artifact: re-verifications append fresh
//! location rows, and no event is ever edited or deleted.

use crate::errors::{PreservationError, PreservationResult};
use crate::models::{
    artifact::{Artifact, ArtifactStatus},
    event::{EventOutcome, EventType, PreservationEvent},
    location::{StorageLocation, StorageTier, VerificationOutcome},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Apply the embedded schema. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> PreservationResult<()> {
    let sql = include_str!("../migrations/0001_init.sql");
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

/// Repository for artifact records.
#[derive(Clone)]
pub struct ArtifactRepo {
    db: Arc<SqlitePool>,
}

impl ArtifactRepo {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, artifact: &Artifact) -> PreservationResult<()> {
        sqlx::query(
            "INSERT INTO artifacts (
                id, filename, content_type, declared_size, declared_md5,
                declared_sha256, checksum_md5, checksum_sha256, size_bytes,
                status, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(artifact.id)
        .bind(&artifact.filename)
        .bind(&artifact.content_type)
        .bind(artifact.declared_size)
        .bind(&artifact.declared_md5)
        .bind(&artifact.declared_sha256)
        .bind(&artifact.checksum_md5)
        .bind(&artifact.checksum_sha256)
        .bind(artifact.size_bytes)
        .bind(artifact.status)
        .bind(artifact.created_at)
        .bind(artifact.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, id: Uuid) -> PreservationResult<Artifact> {
        sqlx::query_as::<_, Artifact>(
            "SELECT id, filename, content_type, declared_size, declared_md5,
                    declared_sha256, checksum_md5, checksum_sha256, size_bytes,
                    status, created_at, updated_at
             FROM artifacts WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => PreservationError::ArtifactNotFound(id),
            other => PreservationError::Sqlx(other),
        })
    }

    pub async fn update_status(&self, id: Uuid, status: ArtifactStatus) -> PreservationResult<()> {
        let result = sqlx::query("UPDATE artifacts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PreservationError::ArtifactNotFound(id));
        }
        Ok(())
    }

    /// Record the computed digests and actual size once the stream has been
    /// fully consumed.
    pub async fn record_digests(
        &self,
        id: Uuid,
        md5: &str,
        sha256: &str,
        size_bytes: i64,
    ) -> PreservationResult<()> {
        let result = sqlx::query(
            "UPDATE artifacts
             SET checksum_md5 = ?, checksum_sha256 = ?, size_bytes = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(md5)
        .bind(sha256)
        .bind(size_bytes)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PreservationError::ArtifactNotFound(id));
        }
        Ok(())
    }

    /// Ids of artifacts currently in the given status. Used at startup to
    /// requeue replication work interrupted by a crash.
    pub async fn ids_with_status(&self, status: ArtifactStatus) -> PreservationResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM artifacts WHERE status = ?")
            .bind(status)
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }
}

/// Repository for storage location rows (the Storage Location Tracker).
#[derive(Clone)]
pub struct LocationRepo {
    db: Arc<SqlitePool>,
}

impl LocationRepo {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn append(&self, location: &StorageLocation) -> PreservationResult<()> {
        sqlx::query(
            "INSERT INTO storage_locations (
                id, artifact_id, tier, handle, digest, size_bytes, outcome, verified_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(location.id)
        .bind(location.artifact_id)
        .bind(location.tier)
        .bind(&location.handle)
        .bind(&location.digest)
        .bind(location.size_bytes)
        .bind(location.outcome)
        .bind(location.verified_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn list(&self, artifact_id: Uuid) -> PreservationResult<Vec<StorageLocation>> {
        let rows = sqlx::query_as::<_, StorageLocation>(
            "SELECT id, artifact_id, tier, handle, digest, size_bytes, outcome, verified_at
             FROM storage_locations WHERE artifact_id = ? ORDER BY rowid ASC",
        )
        .bind(artifact_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Most recent verified copy in a tier, if any.
    pub async fn latest_verified(
        &self,
        artifact_id: Uuid,
        tier: StorageTier,
    ) -> PreservationResult<Option<StorageLocation>> {
        let row = sqlx::query_as::<_, StorageLocation>(
            "SELECT id, artifact_id, tier, handle, digest, size_bytes, outcome, verified_at
             FROM storage_locations
             WHERE artifact_id = ? AND tier = ? AND outcome = ?
             ORDER BY rowid DESC LIMIT 1",
        )
        .bind(artifact_id)
        .bind(tier)
        .bind(VerificationOutcome::Verified)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Number of distinct verified copies in a tier. Re-check rows for the
    /// same handle count once.
    pub async fn verified_count(
        &self,
        artifact_id: Uuid,
        tier: StorageTier,
    ) -> PreservationResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT handle) FROM storage_locations
             WHERE artifact_id = ? AND tier = ? AND outcome = ?",
        )
        .bind(artifact_id)
        .bind(tier)
        .bind(VerificationOutcome::Verified)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }
}

/// Repository for preservation events (the Preservation Event Log).
#[derive(Clone)]
pub struct EventRepo {
    db: Arc<SqlitePool>,
}

impl EventRepo {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Append one event and return it with its database-assigned sequence
    /// number. The insert commits independently of whatever operation
    /// triggered it, so failure events survive the failure they document.
    pub async fn append(
        &self,
        artifact_id: Uuid,
        event_type: EventType,
        outcome: EventOutcome,
        detail: impl Into<Option<String>>,
    ) -> PreservationResult<PreservationEvent> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let detail = detail.into();

        let seq = sqlx::query_scalar::<_, i64>(
            "INSERT INTO preservation_events (
                id, artifact_id, event_type, outcome, detail, created_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             RETURNING seq",
        )
        .bind(id)
        .bind(artifact_id)
        .bind(event_type)
        .bind(outcome)
        .bind(&detail)
        .bind(created_at)
        .fetch_one(&*self.db)
        .await?;

        Ok(PreservationEvent {
            seq,
            id,
            artifact_id,
            event_type,
            outcome,
            detail,
            created_at,
        })
    }

    /// Full ordered history for an artifact.
    pub async fn list(&self, artifact_id: Uuid) -> PreservationResult<Vec<PreservationEvent>> {
        let rows = sqlx::query_as::<_, PreservationEvent>(
            "SELECT seq, id, artifact_id, event_type, outcome, detail, created_at
             FROM preservation_events WHERE artifact_id = ? ORDER BY seq ASC",
        )
        .bind(artifact_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> Arc<SqlitePool> {
        // One connection: each in-memory SQLite connection is its own database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        migrate(&pool).await.expect("migrate");
        Arc::new(pool)
    }

    fn artifact(status: ArtifactStatus) -> Artifact {
        let now = Utc::now();
        Artifact {
            id: Uuid::new_v4(),
            filename: "tape.wav".into(),
            content_type: Some("audio/wav".into()),
            declared_size: None,
            declared_md5: None,
            declared_sha256: None,
            checksum_md5: None,
            checksum_sha256: None,
            size_bytes: 0,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn artifact_round_trip_and_status_update() {
        let db = pool().await;
        let repo = ArtifactRepo::new(db);
        let a = artifact(ArtifactStatus::Uploading);
        repo.insert(&a).await.expect("insert");

        let fetched = repo.fetch(a.id).await.expect("fetch");
        assert_eq!(fetched.status, ArtifactStatus::Uploading);
        assert_eq!(fetched.filename, "tape.wav");

        repo.update_status(a.id, ArtifactStatus::Stored)
            .await
            .expect("update");
        let fetched = repo.fetch(a.id).await.expect("fetch");
        assert_eq!(fetched.status, ArtifactStatus::Stored);
        assert!(fetched.updated_at >= a.updated_at);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let db = pool().await;
        let repo = ArtifactRepo::new(db);
        let err = repo.fetch(Uuid::new_v4()).await.expect_err("missing");
        assert!(matches!(err, PreservationError::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn events_are_ordered_and_append_only() {
        let db = pool().await;
        let artifacts = ArtifactRepo::new(db.clone());
        let events = EventRepo::new(db);

        let a = artifact(ArtifactStatus::Uploading);
        artifacts.insert(&a).await.expect("insert");

        events
            .append(a.id, EventType::IngestStart, EventOutcome::Success, None)
            .await
            .expect("append");
        events
            .append(
                a.id,
                EventType::StorageWrite,
                EventOutcome::Success,
                Some("hot".to_string()),
            )
            .await
            .expect("append");
        events
            .append(a.id, EventType::IngestComplete, EventOutcome::Success, None)
            .await
            .expect("append");

        let history = events.list(a.id).await.expect("list");
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(
            history
                .windows(2)
                .all(|w| w[0].created_at <= w[1].created_at)
        );
        assert_eq!(history[0].event_type, EventType::IngestStart);
        assert_eq!(history[2].event_type, EventType::IngestComplete);

        // The sequence never shrinks across calls.
        let again = events.list(a.id).await.expect("list");
        assert!(again.len() >= history.len());
    }

    #[tokio::test]
    async fn verified_count_ignores_mismatch_rows() {
        let db = pool().await;
        let artifacts = ArtifactRepo::new(db.clone());
        let locations = LocationRepo::new(db);

        let a = artifact(ArtifactStatus::Stored);
        artifacts.insert(&a).await.expect("insert");

        let mut loc = StorageLocation {
            id: Uuid::new_v4(),
            artifact_id: a.id,
            tier: StorageTier::Hot,
            handle: "artifacts/2026/08/x/tape.wav".into(),
            digest: "abc".into(),
            size_bytes: 10,
            outcome: VerificationOutcome::Verified,
            verified_at: Utc::now(),
        };
        locations.append(&loc).await.expect("append verified");

        // A later scrub that found drift appends a mismatch row for the same
        // handle; it must not count as a verified copy.
        loc.id = Uuid::new_v4();
        loc.outcome = VerificationOutcome::Mismatch;
        locations.append(&loc).await.expect("append mismatch");

        let count = locations
            .verified_count(a.id, StorageTier::Hot)
            .await
            .expect("count");
        assert_eq!(count, 1);
        assert_eq!(
            locations
                .verified_count(a.id, StorageTier::Archive)
                .await
                .expect("count"),
            0
        );

        let all = locations.list(a.id).await.expect("list");
        assert_eq!(all.len(), 2);

        let latest = locations
            .latest_verified(a.id, StorageTier::Hot)
            .await
            .expect("latest")
            .expect("present");
        assert_eq!(latest.outcome, VerificationOutcome::Verified);
    }
}
