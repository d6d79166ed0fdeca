//! PREMIS-style preservation events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Type of a preservation event.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum EventType {
    IngestStart,
    IngestComplete,
    FixityCheck,
    StorageWrite,
    ReplicationAttempt,
    ReplicationSuccess,
    ReplicationFailure,
    FixityMismatch,
}

/// Outcome of a preservation event.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventOutcome {
    Success,
    Failure,
}

/// An immutable record of one lifecycle transition.
///
/// Events are never edited or deleted; the event documenting a failure is
/// itself part of the permanent record. `seq` is assigned by the database
/// and totally orders the history of an artifact.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PreservationEvent {
    /// Database-assigned, monotonically increasing sequence number.
    pub seq: i64,

    /// Event UUID.
    pub id: Uuid,

    /// Artifact this event belongs to.
    pub artifact_id: Uuid,

    /// What happened.
    pub event_type: EventType,

    /// Whether it succeeded.
    pub outcome: EventOutcome,

    /// Free-form detail (error text, storage handles, attempt counters).
    pub detail: Option<String>,

    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}
