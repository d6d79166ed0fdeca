//! Error types: the preservation domain taxonomy and the HTTP wrapper.

use crate::models::artifact::ArtifactStatus;
use crate::models::location::StorageTier;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Domain errors raised by the preservation core.
///
/// Fatal and drift errors are logged as permanent preservation events before
/// being surfaced; transient errors are retried by the replication
/// coordinator and only surfaced once retries are exhausted.
#[derive(Debug, Error)]
pub enum PreservationError {
    /// The inbound stream broke mid-ingest. Terminal for ingestion: no
    /// artifact is ever published from an incomplete stream.
    #[error("stream read failed: {0}")]
    StreamRead(String),

    /// Caller-declared digest and computed digest differ at ingest.
    #[error("checksum mismatch ({algorithm}): declared {declared}, computed {computed}")]
    ChecksumMismatch {
        algorithm: &'static str,
        declared: String,
        computed: String,
    },

    /// A storage adapter write failed. Fatal for ingestion, retryable for
    /// replication.
    #[error("storage write failed: {0}")]
    StorageWrite(String),

    /// Transient replication failure (transport error, timeout, temporary
    /// unavailability). Retried with backoff.
    #[error("transient replication failure: {0}")]
    ReplicationTransient(String),

    /// Retries exhausted or a post-copy fixity mismatch.
    #[error("replication failed permanently: {0}")]
    ReplicationFatal(String),

    /// A scrub found that a previously verified copy no longer matches the
    /// digest of record. The copy is not auto-deleted.
    #[error("fixity drift on {tier} copy: expected {expected}, computed {computed}")]
    FixityDrift {
        tier: StorageTier,
        expected: String,
        computed: String,
    },

    /// The requested operation is illegal for the artifact's current status.
    #[error("invalid transition: cannot {requested} an artifact in status {status:?}")]
    InvalidStateTransition {
        status: ArtifactStatus,
        requested: &'static str,
    },

    #[error("artifact `{0}` not found")]
    ArtifactNotFound(Uuid),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type PreservationResult<T> = Result<T, PreservationError>;

impl PreservationError {
    /// Whether a replication attempt that failed with this error may be
    /// retried under backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PreservationError::ReplicationTransient(_)
                | PreservationError::StorageWrite(_)
                | PreservationError::StreamRead(_)
                | PreservationError::Io(_)
        )
    }
}

/// A lightweight wrapper for errors crossing the HTTP boundary.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<PreservationError> for AppError {
    fn from(err: PreservationError) -> Self {
        let status = match &err {
            PreservationError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            PreservationError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PreservationError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            PreservationError::StreamRead(_) | PreservationError::InvalidKey(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
