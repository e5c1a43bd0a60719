//! Workflow templates, instances, runs, and steps
//!
//! A template declares ordered step templates; a workflow binds inputs;
//! a run executes the chain, one job per step, each created when its
//! predecessor's job succeeds.

use crate::config::ConfigMap;
use crate::{
    JobAgentId, JobId, WorkflowId, WorkflowRunId, WorkflowStepId, WorkflowTemplateId, WorkspaceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Declared input of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    /// Input name
    pub name: String,

    /// Default bound when the workflow omits the input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// One step declaration inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepTemplate {
    /// Step name
    pub name: String,

    /// Agent executing this step's job
    pub job_agent_id: JobAgentId,

    /// Agent config for this step's job
    #[serde(default)]
    pub job_agent_config: ConfigMap,
}

/// Ordered list of step templates plus declared inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Unique template identifier
    pub id: WorkflowTemplateId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// Declared inputs
    #[serde(default)]
    pub inputs: Vec<WorkflowInput>,

    /// Ordered step declarations
    #[serde(default)]
    pub step_templates: Vec<WorkflowStepTemplate>,
}

/// A template instance with bound input values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier
    pub id: WorkflowId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Template this workflow instantiates
    pub template_id: WorkflowTemplateId,

    /// Display name
    pub name: String,

    /// Bound inputs
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    Completed,
    Failed,
}

/// One execution of a workflow: a chain of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run identifier
    pub id: WorkflowRunId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Workflow being executed
    pub workflow_id: WorkflowId,

    /// Lifecycle status
    pub status: WorkflowRunStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One step of a run. Its job is created when the predecessor step's
/// job reaches terminal success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique step identifier
    pub id: WorkflowStepId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Run this step belongs to
    pub run_id: WorkflowRunId,

    /// Position in the chain, zero-based
    pub index: usize,

    /// Step name, copied from the template
    pub name: String,

    /// Agent executing the step
    pub job_agent_id: JobAgentId,

    /// Agent config for the step's job
    #[serde(default)]
    pub job_agent_config: ConfigMap,

    /// Job created for this step, once its turn arrives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}
