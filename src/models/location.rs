//! Represents one physical copy of an artifact in a storage tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The storage tier a copy lives in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StorageTier {
    /// Fast, immediately accessible storage for active artifacts.
    Hot,
    /// Durable, higher-latency long-term storage.
    Archive,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Hot => f.write_str("hot"),
            StorageTier::Archive => f.write_str("archive"),
        }
    }
}

/// Result of the verification that produced a location row.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum VerificationOutcome {
    Verified,
    Mismatch,
}

/// One physical copy of an artifact, or one re-verification of such a copy.
///
/// Rows are append-only: the initial write produces one row, and every later
/// scrub appends a fresh row recording that re-check. A copy counts towards
/// `Stored`/`Archived` eligibility only when its outcome is `Verified`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StorageLocation {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Back-reference to the owning artifact (non-owning).
    pub artifact_id: Uuid,

    /// Tier this copy lives in.
    pub tier: StorageTier,

    /// Opaque location handle returned by the tier's storage adapter.
    pub handle: String,

    /// SHA-256 computed over the copy at verification time.
    pub digest: String,

    /// Size of the copy in bytes.
    pub size_bytes: i64,

    /// Whether the digest matched the digest of record.
    pub outcome: VerificationOutcome,

    /// When this verification happened.
    pub verified_at: DateTime<Utc>,
}
