//! Jobs, job agents, and the dispatch context snapshot

use crate::config::ConfigMap;
use crate::deployment::{Deployment, DeploymentVersion};
use crate::environment::Environment;
use crate::resource::Resource;
use crate::{JobAgentId, JobId, ReleaseId, WorkflowRunId, WorkflowStepId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// An executor jobs are dispatched to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAgent {
    /// Unique agent identifier
    pub id: JobAgentId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// Agent kind, e.g. "kubernetes", "github"
    pub kind: String,

    /// Agent-level config (merge base layer)
    #[serde(default)]
    pub config: ConfigMap,
}

impl JobAgent {
    pub fn new(
        id: impl Into<JobAgentId>,
        workspace_id: impl Into<WorkspaceId>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            kind: kind.into(),
            config: ConfigMap::new(),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for an executor to pick it up
    Pending,
    /// An executor is running it
    InProgress,
    /// Terminal success
    Successful,
    /// Terminal failure
    Failure,
    /// Terminal, superseded or target disappeared
    Cancelled,
    /// Terminal, executor declined to run it
    Skipped,
    /// Marker: created while the deployment had no usable agent
    InvalidJobAgent,
}

impl JobStatus {
    /// Pending or InProgress: counts against the one-in-flight limit.
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Any state no executor will move the job out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failure | Self::Cancelled | Self::Skipped
        )
    }

    /// Whether an external `JobUpdate` may move a job from `self` to
    /// `next`. Terminal states and agent markers never transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::InProgress
                    | Self::Cancelled
                    | Self::Skipped
                    | Self::Failure
                    | Self::Successful
            ),
            Self::InProgress => {
                matches!(next, Self::Successful | Self::Failure | Self::Cancelled)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid job status transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// The command handed to an external executor. Carries a frozen
/// [`DispatchContext`]; belongs to either a release or a workflow step,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Release this job converges, for release jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<ReleaseId>,

    /// Workflow step this job executes, for workflow jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_step_id: Option<WorkflowStepId>,

    /// Agent the job was dispatched to, when one was configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_agent_id: Option<JobAgentId>,

    /// Fully merged agent config, frozen at creation
    #[serde(default)]
    pub job_agent_config: ConfigMap,

    /// Lifecycle status
    pub status: JobStatus,

    /// Frozen world-view at dispatch time
    pub dispatch_context: DispatchContext,

    /// Optional executor-reported detail for the latest transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Set when the job reaches a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Apply an external status transition, stamping timestamps.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

/// Immutable point-in-time copy of everything an executor needs. Deep
/// copies break the entity reference cycles; mutations to the live
/// entities never reach a dispatched job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_agent: Option<JobAgent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<DeploymentVersion>,

    /// Resolved variables frozen with the release
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Workflow context for workflow-step jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowDispatchContext>,
}

/// Workflow slice of a dispatch context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDispatchContext {
    /// Run the step belongs to
    pub run_id: WorkflowRunId,

    /// Step being executed
    pub step_id: WorkflowStepId,

    /// Zero-based step index within the run
    pub index: usize,

    /// Inputs bound on the workflow instance
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}
