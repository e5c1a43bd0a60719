//! KEEL Types - Core entity model for the workspace engine
//!
//! KEEL is the stateful core of a continuous-delivery control plane:
//! given a stream of declarative events it computes release targets,
//! desired releases, policy verdicts, and the jobs handed to external
//! executors.
//!
//! ## Architectural Boundaries
//!
//! - **keel-types** owns: entity shapes, typed ids, wire event names,
//!   the job-agent config merge
//! - **keel-store** owns: keyed collections and change tracking
//! - **keel-engine** owns: event dispatch, recompute, workspace lifecycle
//!
//! ## Key Concepts
//!
//! - **ReleaseTarget**: a (deployment, environment, resource) triple the
//!   engine converges as a unit
//! - **Release**: frozen combination of a target and a version plus its
//!   resolved variables and merged agent config
//! - **Job**: the command handed to an external executor; carries an
//!   immutable [`DispatchContext`]
//! - **Policy**: governance rules gating which version a target may
//!   converge to

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod deployment;
pub mod environment;
pub mod events;
pub mod github;
pub mod ids;
pub mod job;
pub mod policy;
pub mod relationship;
pub mod release;
pub mod resource;
pub mod selector;
pub mod system;
pub mod variables;
pub mod verification;
pub mod workflow;

// Re-export main types
pub use config::{deep_merge, merge_job_agent_config, ConfigMap};
pub use deployment::{Deployment, DeploymentVersion, VersionStatus};
pub use environment::Environment;
pub use events::{
    EngineEvent, EngineEventEnvelope, EngineEventSeverity, EngineEventSource, EventKind,
    UnknownEventKind, WorkspaceEvent,
};
pub use github::GithubEntity;
pub use ids::{
    DeploymentId, EnvironmentId, JobAgentId, JobId, PolicyId, RelationshipRuleId, ReleaseId,
    ResourceId, ResourceProviderId, RuleId, SkipId, SystemId, UserId, VariableId, VariableValueId,
    VerificationId, VersionId, WorkflowId, WorkflowRunId, WorkflowStepId, WorkflowTemplateId,
    WorkspaceId,
};
pub use job::{
    DispatchContext, InvalidTransition, Job, JobAgent, JobStatus, WorkflowDispatchContext,
};
pub use policy::{
    ApprovalStatus, Policy, PolicyRule, PolicyRuleKind, PolicySkip, UserApprovalRecord,
};
pub use relationship::{
    PropertyOperator, RelationshipEntityType, RelationshipMatcher, RelationshipRule,
};
pub use release::{Release, ReleaseTarget};
pub use resource::{Resource, ResourceProvider};
pub use selector::{ConditionNode, ConditionOperator, Selector, TargetSelector};
pub use system::System;
pub use variables::{
    DeploymentVariable, DeploymentVariableValue, ResourceVariable, VariableValue,
};
pub use verification::{
    JobVerification, Measurement, MetricProvider, VerificationMetricSpec, VerificationStatus,
};
pub use workflow::{
    Workflow, WorkflowInput, WorkflowRun, WorkflowRunStatus, WorkflowStep, WorkflowStepTemplate,
    WorkflowTemplate,
};
