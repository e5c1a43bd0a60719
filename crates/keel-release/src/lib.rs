//! KEEL Release - Release manager and verification lifecycle
//!
//! The release manager drives every release target through the same
//! idempotent pass: rank ready versions newest-first, stop at the first
//! policy-permitted one, freeze a release (variables + merged agent
//! config), and converge the job state onto it. Strict invariants:
//!
//! - at most one job per target is Pending or InProgress
//! - a job's dispatch context and merged agent config never change
//!   after creation
//! - a release becomes current only through a terminally successful,
//!   verification-passing job
//!
//! Verification runs outside the workspace lock on per-metric tasks and
//! re-enters the engine as resolutions on a channel.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod current;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod verification;

// Re-exports
pub use current::{current_release_for_target, is_verified_success};
pub use dispatch::{release_dispatch_context, workflow_dispatch_context};
pub use error::{ReleaseError, Result};
pub use manager::{
    JobUpdateOutcome, ReconcileDeps, ReconcileNote, ReconcileOutcome, ReleaseManager,
};
pub use verification::{VerificationManager, VerificationResolution};
