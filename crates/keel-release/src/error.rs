//! Release manager errors

use keel_types::{InvalidTransition, JobId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReleaseError>;

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}
