//! Event kinds, the inbound event envelope, and the observability stream
//!
//! Inbound events are the only way external systems mutate a workspace.
//! Kind names are part of the wire contract and never change.

use crate::{JobId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Every inbound event kind, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SystemCreate,
    SystemUpdate,
    SystemDelete,
    DeploymentCreate,
    DeploymentUpdate,
    DeploymentDelete,
    EnvironmentCreate,
    EnvironmentUpdate,
    EnvironmentDelete,
    ResourceCreate,
    ResourceUpdate,
    ResourceDelete,
    ResourceProviderCreate,
    ResourceProviderUpdate,
    ResourceProviderDelete,
    JobAgentCreate,
    JobAgentUpdate,
    JobAgentDelete,
    DeploymentVersionCreate,
    DeploymentVersionUpdate,
    DeploymentVersionDelete,
    DeploymentVariableCreate,
    DeploymentVariableUpdate,
    DeploymentVariableDelete,
    DeploymentVariableValueCreate,
    DeploymentVariableValueUpdate,
    DeploymentVariableValueDelete,
    ResourceVariableCreate,
    ResourceVariableUpdate,
    ResourceVariableDelete,
    PolicyCreate,
    PolicyUpdate,
    PolicyDelete,
    PolicySkipCreate,
    PolicySkipUpdate,
    PolicySkipDelete,
    UserApprovalRecordCreate,
    UserApprovalRecordUpdate,
    UserApprovalRecordDelete,
    RelationshipRuleCreate,
    RelationshipRuleUpdate,
    RelationshipRuleDelete,
    GithubEntityCreate,
    GithubEntityUpdate,
    GithubEntityDelete,
    /// Jobs are never created externally, only updated.
    JobUpdate,
    WorkflowCreate,
    WorkflowTemplateCreate,
    WorkflowRunCreate,
    SystemDeploymentLinked,
    SystemDeploymentUnlinked,
    SystemEnvironmentLinked,
    SystemEnvironmentUnlinked,
}

impl EventKind {
    /// The bit-exact wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemCreate => "SystemCreate",
            Self::SystemUpdate => "SystemUpdate",
            Self::SystemDelete => "SystemDelete",
            Self::DeploymentCreate => "DeploymentCreate",
            Self::DeploymentUpdate => "DeploymentUpdate",
            Self::DeploymentDelete => "DeploymentDelete",
            Self::EnvironmentCreate => "EnvironmentCreate",
            Self::EnvironmentUpdate => "EnvironmentUpdate",
            Self::EnvironmentDelete => "EnvironmentDelete",
            Self::ResourceCreate => "ResourceCreate",
            Self::ResourceUpdate => "ResourceUpdate",
            Self::ResourceDelete => "ResourceDelete",
            Self::ResourceProviderCreate => "ResourceProviderCreate",
            Self::ResourceProviderUpdate => "ResourceProviderUpdate",
            Self::ResourceProviderDelete => "ResourceProviderDelete",
            Self::JobAgentCreate => "JobAgentCreate",
            Self::JobAgentUpdate => "JobAgentUpdate",
            Self::JobAgentDelete => "JobAgentDelete",
            Self::DeploymentVersionCreate => "DeploymentVersionCreate",
            Self::DeploymentVersionUpdate => "DeploymentVersionUpdate",
            Self::DeploymentVersionDelete => "DeploymentVersionDelete",
            Self::DeploymentVariableCreate => "DeploymentVariableCreate",
            Self::DeploymentVariableUpdate => "DeploymentVariableUpdate",
            Self::DeploymentVariableDelete => "DeploymentVariableDelete",
            Self::DeploymentVariableValueCreate => "DeploymentVariableValueCreate",
            Self::DeploymentVariableValueUpdate => "DeploymentVariableValueUpdate",
            Self::DeploymentVariableValueDelete => "DeploymentVariableValueDelete",
            Self::ResourceVariableCreate => "ResourceVariableCreate",
            Self::ResourceVariableUpdate => "ResourceVariableUpdate",
            Self::ResourceVariableDelete => "ResourceVariableDelete",
            Self::PolicyCreate => "PolicyCreate",
            Self::PolicyUpdate => "PolicyUpdate",
            Self::PolicyDelete => "PolicyDelete",
            Self::PolicySkipCreate => "PolicySkipCreate",
            Self::PolicySkipUpdate => "PolicySkipUpdate",
            Self::PolicySkipDelete => "PolicySkipDelete",
            Self::UserApprovalRecordCreate => "UserApprovalRecordCreate",
            Self::UserApprovalRecordUpdate => "UserApprovalRecordUpdate",
            Self::UserApprovalRecordDelete => "UserApprovalRecordDelete",
            Self::RelationshipRuleCreate => "RelationshipRuleCreate",
            Self::RelationshipRuleUpdate => "RelationshipRuleUpdate",
            Self::RelationshipRuleDelete => "RelationshipRuleDelete",
            Self::GithubEntityCreate => "GithubEntityCreate",
            Self::GithubEntityUpdate => "GithubEntityUpdate",
            Self::GithubEntityDelete => "GithubEntityDelete",
            Self::JobUpdate => "JobUpdate",
            Self::WorkflowCreate => "WorkflowCreate",
            Self::WorkflowTemplateCreate => "WorkflowTemplateCreate",
            Self::WorkflowRunCreate => "WorkflowRunCreate",
            Self::SystemDeploymentLinked => "SystemDeploymentLinked",
            Self::SystemDeploymentUnlinked => "SystemDeploymentUnlinked",
            Self::SystemEnvironmentLinked => "SystemEnvironmentLinked",
            Self::SystemEnvironmentUnlinked => "SystemEnvironmentUnlinked",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| UnknownEventKind(s.to_string()))
    }
}

/// An inbound event: a kind, a target workspace, and a JSON payload
/// whose shape matches the entity for that kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    /// Kind routing the payload to its handler
    pub kind: EventKind,

    /// Target workspace
    pub workspace_id: WorkspaceId,

    /// Raw entity payload; `any`-valued maps round-trip losslessly
    pub payload: Value,
}

impl WorkspaceEvent {
    pub fn new(kind: EventKind, workspace_id: impl Into<WorkspaceId>, payload: Value) -> Self {
        Self {
            kind,
            workspace_id: workspace_id.into(),
            payload,
        }
    }
}

/// Source subsystem of an observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEventSource {
    Dispatcher,
    ReleaseManager,
    Verification,
    Workflow,
    Registry,
}

/// Severity of an observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Envelope published on the engine's broadcast stream. Purely
/// observational; dropping it never changes engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Emitting subsystem
    pub source: EngineEventSource,

    /// Event severity
    pub severity: EngineEventSeverity,

    /// Workspace the event concerns
    pub workspace_id: WorkspaceId,

    /// The actual event
    pub event: EngineEvent,
}

/// Observability events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// An inbound event was applied
    EventApplied {
        kind: EventKind,
    },

    /// An inbound event was rejected before any mutation
    EventRejected {
        kind: EventKind,
        reason: String,
    },

    /// A job was created
    JobCreated {
        job_id: JobId,
        release_target_key: Option<String>,
    },

    /// A job changed status
    JobTransitioned {
        job_id: JobId,
        status: String,
    },

    /// A release became current for its target
    ReleaseCurrent {
        release_target_key: String,
        version_tag: String,
    },

    /// Verification started for a job
    VerificationStarted {
        job_id: JobId,
    },

    /// Verification resolved for a job
    VerificationResolved {
        job_id: JobId,
        passed: bool,
    },

    /// A workflow run advanced to a new step
    WorkflowAdvanced {
        run_id: String,
        step_index: usize,
    },

    /// A workspace snapshot was taken or restored
    SnapshotTaken {
        entity_count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::SystemCreate.as_str(), "SystemCreate");
        assert_eq!(
            EventKind::DeploymentVariableValueUpdate.as_str(),
            "DeploymentVariableValueUpdate"
        );
        assert_eq!(
            EventKind::SystemEnvironmentUnlinked.as_str(),
            "SystemEnvironmentUnlinked"
        );
    }

    #[test]
    fn test_event_kind_serde_matches_as_str() {
        for kind in [
            EventKind::JobUpdate,
            EventKind::PolicySkipCreate,
            EventKind::WorkflowRunCreate,
            EventKind::SystemDeploymentLinked,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn test_event_kind_from_str() {
        let kind: EventKind = "ResourceProviderDelete".parse().unwrap();
        assert_eq!(kind, EventKind::ResourceProviderDelete);
        assert!("NotAnEvent".parse::<EventKind>().is_err());
    }
}
