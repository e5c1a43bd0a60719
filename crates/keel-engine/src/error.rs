//! Engine errors
//!
//! Only decode failures and snapshot corruption surface to the caller;
//! everything else recovers locally on the reconcile path.

use keel_types::EventKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed event payload. The event is rejected before any
    /// mutation; the store is unchanged.
    #[error("failed to decode {kind} payload: {source}")]
    InputDecode {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Snapshot(#[from] keel_store::SnapshotError),

    #[error(transparent)]
    Release(#[from] keel_release::ReleaseError),

    #[error(transparent)]
    Workflow(#[from] keel_workflow::WorkflowError),
}

impl EngineError {
    /// Whether the error rejected an event before any mutation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, EngineError::InputDecode { .. })
    }
}
