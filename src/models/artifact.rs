//! Represents a preserved artifact and its lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of an artifact.
///
/// The happy path is `Uploading → Stored → Replicating → Archived`.
/// `Failed` is reachable from any non-terminal state. `Archived` may move
/// to `Degraded` when a scrub detects fixity drift; remediation re-kicks
/// replication from the still-good copy (`Degraded → Replicating`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Uploading,
    Stored,
    Replicating,
    Archived,
    Degraded,
    Failed,
}

impl ArtifactStatus {
    /// True for states from which no further preservation work is scheduled.
    pub fn is_terminal(self) -> bool {
        matches!(self, ArtifactStatus::Archived | ArtifactStatus::Failed)
    }
}

/// A single preserved artifact.
///
/// The artifact row stores identity, the caller-declared checksums (if any),
/// the computed digests of record, and the current lifecycle status. Physical
/// copies and audit history live in their own append-only collections keyed
/// by `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Artifact {
    /// Unique identifier, assigned at ingest.
    pub id: Uuid,

    /// Original filename supplied by the caller.
    pub filename: String,

    /// Content type (MIME type), if the caller declared one.
    pub content_type: Option<String>,

    /// Size the caller declared up front, if any.
    pub declared_size: Option<i64>,

    /// Caller-declared MD5, hex-encoded.
    pub declared_md5: Option<String>,

    /// Caller-declared SHA-256, hex-encoded.
    pub declared_sha256: Option<String>,

    /// Computed MD5 of the ingested bytes.
    pub checksum_md5: Option<String>,

    /// Computed SHA-256 of the ingested bytes. This is the digest of record
    /// every later verification compares against.
    pub checksum_sha256: Option<String>,

    /// Actual number of bytes streamed at ingest.
    pub size_bytes: i64,

    /// Current lifecycle status.
    pub status: ArtifactStatus,

    /// When the artifact record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last mutated (status change or checksum update).
    pub updated_at: DateTime<Utc>,
}
