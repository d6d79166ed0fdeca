//! Fixity verification: declared-vs-computed checks at ingest and
//! digest-of-record comparisons for stored copies.

use crate::digest::DigestSet;
use crate::errors::{PreservationError, PreservationResult};
use crate::models::location::StorageTier;

/// Checksums the caller declared at ingestion time. All optional; when none
/// are present the computed digests become the digests of record.
#[derive(Clone, Debug, Default)]
pub struct DeclaredChecksums {
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

impl DeclaredChecksums {
    pub fn is_empty(&self) -> bool {
        self.md5.is_none() && self.sha256.is_none()
    }
}

/// Result of comparing a freshly computed digest against a reference digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchResult {
    Match,
    Mismatch { expected: String, computed: String },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Match)
    }
}

/// Compare hex digests case-insensitively.
fn compare(expected: &str, computed: &str) -> MatchResult {
    if expected.eq_ignore_ascii_case(computed) {
        MatchResult::Match
    } else {
        MatchResult::Mismatch {
            expected: expected.to_ascii_lowercase(),
            computed: computed.to_string(),
        }
    }
}

/// Verify computed digests against whatever the caller declared.
///
/// A mismatch on any declared algorithm is a hard `ChecksumMismatch` failure
/// that halts the pipeline for the artifact. Declaring nothing is fine.
pub fn verify_declared(computed: &DigestSet, declared: &DeclaredChecksums) -> PreservationResult<()> {
    if let Some(expected) = &declared.md5 {
        if let MatchResult::Mismatch { expected, computed } = compare(expected, &computed.md5) {
            return Err(PreservationError::ChecksumMismatch {
                algorithm: "md5",
                declared: expected,
                computed,
            });
        }
    }
    if let Some(expected) = &declared.sha256 {
        if let MatchResult::Mismatch { expected, computed } = compare(expected, &computed.sha256) {
            return Err(PreservationError::ChecksumMismatch {
                algorithm: "sha256",
                declared: expected,
                computed,
            });
        }
    }
    Ok(())
}

/// Compare a recomputed copy digest against the digest of record.
pub fn verify_copy(digest_of_record: &str, recomputed_sha256: &str) -> MatchResult {
    compare(digest_of_record, recomputed_sha256)
}

/// Build the `FixityDrift` error for a scrub mismatch on one tier.
pub fn drift_error(tier: StorageTier, expected: &str, computed: &str) -> PreservationError {
    PreservationError::FixityDrift {
        tier,
        expected: expected.to_string(),
        computed: computed.to_string(),
    }
}
