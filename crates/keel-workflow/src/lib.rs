//! KEEL Workflow - Workflow run sequencing over chained jobs
//!
//! Workflows reuse the [`keel_types::Job`] entity: a job belongs to a
//! release or to a workflow step, never both. The engine here owns the
//! chain semantics; job status transitions arrive through the same
//! dispatcher path as release jobs.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod engine;
pub mod error;

// Re-exports
pub use engine::{WorkflowAdvance, WorkflowEngine};
pub use error::{Result, WorkflowError};
