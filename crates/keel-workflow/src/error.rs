//! Workflow engine errors

use keel_types::{WorkflowId, WorkflowTemplateId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("workflow template {0} not found")]
    TemplateNotFound(WorkflowTemplateId),

    #[error("workflow template {0} declares no steps")]
    EmptyTemplate(WorkflowTemplateId),
}
