//! Typed event handlers
//!
//! Fixed registry from event kind to handler. Every handler decodes the
//! payload into its entity shape first and only then mutates the store,
//! so a malformed payload rejects the event with the store unchanged.
//! `any`-valued maps decode into `serde_json` maps and round-trip
//! losslessly.

use crate::error::{EngineError, Result};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use keel_release::{JobUpdateOutcome, ReleaseManager};
use keel_types::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Environment,
    EventKind, GithubEntity, JobAgent, JobId, JobStatus, Policy, PolicySkip, RelationshipRule,
    Resource, ResourceProvider, ResourceVariable, System, UserApprovalRecord, Workflow,
    WorkflowTemplate, WorkspaceEvent,
};
use keel_workflow::{WorkflowAdvance, WorkflowEngine};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// What applying an event produced, beyond store mutations.
pub enum AppliedEvent {
    /// Plain entity mutation; the changeset carries the detail
    Mutation,

    /// A job transition with its follow-up work
    JobUpdated(JobUpdateOutcome),

    /// A workflow run was created and its first step started
    WorkflowRunCreated(WorkflowAdvance),
}

fn decode<T: DeserializeOwned>(kind: EventKind, payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|source| EngineError::InputDecode { kind, source })
}

#[derive(Debug, Deserialize)]
struct DeleteById {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalKey {
    version_id: String,
    environment_id: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ResourceVariableKey {
    resource_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct GithubEntityKey {
    slug: String,
    installation_id: i64,
}

#[derive(Debug, Deserialize)]
struct SystemDeploymentLink {
    system_id: String,
    deployment_id: String,
}

#[derive(Debug, Deserialize)]
struct SystemEnvironmentLink {
    system_id: String,
    environment_id: String,
}

#[derive(Debug, Deserialize)]
struct JobUpdatePayload {
    id: String,
    status: JobStatus,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunCreatePayload {
    id: String,
    workflow_id: String,
}

/// Route one event to its handler.
pub fn apply_event(
    workspace: &mut Workspace,
    release: &ReleaseManager,
    workflows: &WorkflowEngine,
    event: &WorkspaceEvent,
    now: DateTime<Utc>,
) -> Result<AppliedEvent> {
    let kind = event.kind;
    let payload = &event.payload;
    let store = &mut workspace.store;

    match kind {
        EventKind::SystemCreate | EventKind::SystemUpdate => {
            let entity: System = decode(kind, payload)?;
            store.upsert_system(entity);
        }
        EventKind::SystemDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_system(&key.id.into());
        }

        EventKind::DeploymentCreate | EventKind::DeploymentUpdate => {
            let entity: Deployment = decode(kind, payload)?;
            store.upsert_deployment(entity);
        }
        EventKind::DeploymentDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_deployment(&key.id.into());
        }

        EventKind::EnvironmentCreate | EventKind::EnvironmentUpdate => {
            let entity: Environment = decode(kind, payload)?;
            store.upsert_environment(entity);
        }
        EventKind::EnvironmentDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_environment(&key.id.into());
        }

        EventKind::ResourceCreate | EventKind::ResourceUpdate => {
            let entity: Resource = decode(kind, payload)?;
            store.upsert_resource(entity);
        }
        EventKind::ResourceDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_resource(&key.id.into());
        }

        EventKind::ResourceProviderCreate | EventKind::ResourceProviderUpdate => {
            let entity: ResourceProvider = decode(kind, payload)?;
            store.upsert_resource_provider(entity);
        }
        EventKind::ResourceProviderDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_resource_provider(&key.id.into());
        }

        EventKind::JobAgentCreate | EventKind::JobAgentUpdate => {
            let entity: JobAgent = decode(kind, payload)?;
            store.upsert_job_agent(entity);
        }
        EventKind::JobAgentDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_job_agent(&key.id.into());
        }

        EventKind::DeploymentVersionCreate | EventKind::DeploymentVersionUpdate => {
            let entity: DeploymentVersion = decode(kind, payload)?;
            store.upsert_version(entity);
        }
        EventKind::DeploymentVersionDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_version(&key.id.into());
        }

        EventKind::DeploymentVariableCreate | EventKind::DeploymentVariableUpdate => {
            let entity: DeploymentVariable = decode(kind, payload)?;
            store.upsert_variable(entity);
        }
        EventKind::DeploymentVariableDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_variable(&key.id.into());
        }

        EventKind::DeploymentVariableValueCreate | EventKind::DeploymentVariableValueUpdate => {
            let entity: DeploymentVariableValue = decode(kind, payload)?;
            store.upsert_variable_value(entity);
        }
        EventKind::DeploymentVariableValueDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_variable_value(&key.id.into());
        }

        EventKind::ResourceVariableCreate | EventKind::ResourceVariableUpdate => {
            let entity: ResourceVariable = decode(kind, payload)?;
            store.upsert_resource_variable(entity);
        }
        EventKind::ResourceVariableDelete => {
            let key: ResourceVariableKey = decode(kind, payload)?;
            store.delete_resource_variable(&key.resource_id.into(), &key.key);
        }

        EventKind::PolicyCreate | EventKind::PolicyUpdate => {
            let entity: Policy = decode(kind, payload)?;
            store.upsert_policy(entity);
        }
        EventKind::PolicyDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_policy(&key.id.into());
        }

        EventKind::PolicySkipCreate | EventKind::PolicySkipUpdate => {
            let entity: PolicySkip = decode(kind, payload)?;
            store.upsert_policy_skip(entity);
        }
        EventKind::PolicySkipDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_policy_skip(&key.id.into());
        }

        EventKind::UserApprovalRecordCreate | EventKind::UserApprovalRecordUpdate => {
            let entity: UserApprovalRecord = decode(kind, payload)?;
            store.upsert_approval(entity);
        }
        EventKind::UserApprovalRecordDelete => {
            let key: ApprovalKey = decode(kind, payload)?;
            store.delete_approval(
                &key.version_id.into(),
                &key.environment_id.into(),
                &key.user_id.into(),
            );
        }

        EventKind::RelationshipRuleCreate | EventKind::RelationshipRuleUpdate => {
            let entity: RelationshipRule = decode(kind, payload)?;
            store.upsert_relationship_rule(entity);
        }
        EventKind::RelationshipRuleDelete => {
            let key: DeleteById = decode(kind, payload)?;
            store.delete_relationship_rule(&key.id.into());
        }

        EventKind::GithubEntityCreate | EventKind::GithubEntityUpdate => {
            let entity: GithubEntity = decode(kind, payload)?;
            store.upsert_github_entity(entity);
        }
        EventKind::GithubEntityDelete => {
            let key: GithubEntityKey = decode(kind, payload)?;
            store.delete_github_entity(&key.slug, key.installation_id);
        }

        EventKind::JobUpdate => {
            let update: JobUpdatePayload = decode(kind, payload)?;
            let outcome = release.apply_job_update(
                store,
                &JobId::new(update.id),
                update.status,
                update.message,
                now,
            )?;
            return Ok(AppliedEvent::JobUpdated(outcome));
        }

        EventKind::WorkflowCreate => {
            let entity: Workflow = decode(kind, payload)?;
            store.upsert_workflow(entity);
        }
        EventKind::WorkflowTemplateCreate => {
            let entity: WorkflowTemplate = decode(kind, payload)?;
            store.upsert_workflow_template(entity);
        }
        EventKind::WorkflowRunCreate => {
            let run: WorkflowRunCreatePayload = decode(kind, payload)?;
            let advance =
                workflows.create_run(store, run.id.into(), &run.workflow_id.into(), now)?;
            return Ok(AppliedEvent::WorkflowRunCreated(advance));
        }

        EventKind::SystemDeploymentLinked => {
            let link: SystemDeploymentLink = decode(kind, payload)?;
            store.link_system_deployment(&link.system_id.into(), &link.deployment_id.into());
        }
        EventKind::SystemDeploymentUnlinked => {
            let link: SystemDeploymentLink = decode(kind, payload)?;
            store.unlink_system_deployment(&link.system_id.into(), &link.deployment_id.into());
        }
        EventKind::SystemEnvironmentLinked => {
            let link: SystemEnvironmentLink = decode(kind, payload)?;
            store.link_system_environment(&link.system_id.into(), &link.environment_id.into());
        }
        EventKind::SystemEnvironmentUnlinked => {
            let link: SystemEnvironmentLink = decode(kind, payload)?;
            store.unlink_system_environment(&link.system_id.into(), &link.environment_id.into());
        }
    }

    Ok(AppliedEvent::Mutation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_workflow::WorkflowEngine;
    use serde_json::json;

    fn apply(
        workspace: &mut Workspace,
        kind: EventKind,
        payload: Value,
    ) -> Result<AppliedEvent> {
        let release = ReleaseManager::new();
        let workflows = WorkflowEngine::new();
        let event = WorkspaceEvent::new(kind, "ws-1", payload);
        apply_event(workspace, &release, &workflows, &event, Utc::now())
    }

    #[test]
    fn test_malformed_payload_leaves_store_unchanged() {
        let mut workspace = Workspace::new("ws-1");
        let err = apply(
            &mut workspace,
            EventKind::ResourceCreate,
            json!({"name": "missing required fields"}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InputDecode { .. }));
        assert_eq!(workspace.store.pending_change_count(), 0);
        assert_eq!(workspace.store.resources().count(), 0);
    }

    #[test]
    fn test_resource_create_preserves_unknown_config_keys() {
        let mut workspace = Workspace::new("ws-1");
        apply(
            &mut workspace,
            EventKind::ResourceCreate,
            json!({
                "id": "res-1",
                "workspace_id": "ws-1",
                "name": "cluster",
                "kind": "Kubernetes",
                "identifier": "k8s/1",
                "config": {"vendor": {"anything": ["goes", 1, true]}}
            }),
        )
        .unwrap();

        let resource = workspace.store.resource(&"res-1".into()).unwrap();
        assert_eq!(
            serde_json::to_value(&resource.config).unwrap(),
            json!({"vendor": {"anything": ["goes", 1, true]}})
        );
    }

    #[test]
    fn test_unknown_job_update_is_an_error() {
        let mut workspace = Workspace::new("ws-1");
        let err = apply(
            &mut workspace,
            EventKind::JobUpdate,
            json!({"id": "job-unknown", "status": "in_progress"}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Release(_)));
    }

    #[test]
    fn test_link_events_round_trip() {
        let mut workspace = Workspace::new("ws-1");
        apply(
            &mut workspace,
            EventKind::DeploymentCreate,
            json!({
                "id": "dep-1",
                "workspace_id": "ws-1",
                "system_id": "sys-1",
                "name": "api"
            }),
        )
        .unwrap();
        apply(
            &mut workspace,
            EventKind::SystemDeploymentLinked,
            json!({"system_id": "sys-2", "deployment_id": "dep-1"}),
        )
        .unwrap();

        let deployment = workspace.store.deployment(&"dep-1".into()).unwrap();
        assert!(deployment.linked_systems.contains(&"sys-2".into()));

        apply(
            &mut workspace,
            EventKind::SystemDeploymentUnlinked,
            json!({"system_id": "sys-2", "deployment_id": "dep-1"}),
        )
        .unwrap();
        let deployment = workspace.store.deployment(&"dep-1".into()).unwrap();
        assert!(deployment.linked_systems.is_empty());
    }
}
