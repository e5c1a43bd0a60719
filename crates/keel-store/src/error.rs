//! Store and snapshot errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Snapshot encode/decode failures. The only store errors that surface
/// to the process boundary; everything else degrades locally.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("snapshot integrity mismatch (expected {expected}, recorded {actual})")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("snapshot storage failure: {0}")]
    Storage(String),
}
