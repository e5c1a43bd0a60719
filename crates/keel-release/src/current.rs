//! Current-release derivation
//!
//! The current release of a target is never stored; it is always
//! derived from job history: the release of the most recent job that
//! reached terminal Successful and whose verification, if one ran,
//! passed. Deleting entities can only ever remove the answer, never
//! silently rewind it to an older release.

use keel_store::WorkspaceStore;
use keel_types::{Job, JobStatus, Release, VerificationStatus};

/// The release currently live on a target, if any.
pub fn current_release_for_target<'a>(
    store: &'a WorkspaceStore,
    target_key: &str,
) -> Option<&'a Release> {
    let job = store
        .jobs_for_release_target(target_key)
        .into_iter()
        .filter(|job| is_verified_success(store, job))
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })?;
    store.release(job.release_id.as_ref()?)
}

/// Successful and, when a verification exists, passed.
pub fn is_verified_success(store: &WorkspaceStore, job: &Job) -> bool {
    if job.status != JobStatus::Successful {
        return false;
    }
    match store.verification_for_job(&job.id) {
        Some(verification) => verification.status == VerificationStatus::Passed,
        None => true,
    }
}
