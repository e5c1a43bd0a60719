//! End-to-end scenarios through the public event surface.
//!
//! Every test drives the engine the way an external system would: JSON
//! event payloads in, jobs and releases observed through the workspace
//! store.

use chrono::{Duration, Utc};
use keel_engine::{Engine, RecomputeStats};
use keel_release::current_release_for_target;
use keel_store::InMemorySnapshotStorage;
use keel_types::{EnvironmentId, EventKind, Job, JobStatus, WorkspaceEvent};
use serde_json::{json, Value};
use std::sync::Arc;

const WS: &str = "ws-1";

fn engine() -> Engine {
    Engine::new(Arc::new(InMemorySnapshotStorage::new()))
}

async fn apply(engine: &Engine, kind: EventKind, payload: Value) -> RecomputeStats {
    engine
        .handle_event(WorkspaceEvent::new(kind, WS, payload))
        .await
        .expect("event applies")
}

/// System, job agent, and a deployment wired to the agent.
async fn seed_system_and_deployment(engine: &Engine) {
    apply(
        engine,
        EventKind::SystemCreate,
        json!({"id": "sys-1", "workspace_id": WS, "name": "checkout"}),
    )
    .await;
    apply(
        engine,
        EventKind::JobAgentCreate,
        json!({"id": "agent-1", "workspace_id": WS, "name": "k8s", "kind": "kubernetes"}),
    )
    .await;
    apply(
        engine,
        EventKind::DeploymentCreate,
        json!({
            "id": "dep-1",
            "workspace_id": WS,
            "system_id": "sys-1",
            "name": "api",
            "job_agent_id": "agent-1"
        }),
    )
    .await;
}

async fn seed_environment(engine: &Engine, id: &str, name: &str) {
    apply(
        engine,
        EventKind::EnvironmentCreate,
        json!({"id": id, "workspace_id": WS, "system_id": "sys-1", "name": name}),
    )
    .await;
}

async fn seed_resource(engine: &Engine, id: &str) {
    apply(
        engine,
        EventKind::ResourceCreate,
        json!({
            "id": id,
            "workspace_id": WS,
            "name": id,
            "kind": "Kubernetes",
            "identifier": format!("k8s/{id}")
        }),
    )
    .await;
}

async fn seed_version(engine: &Engine, id: &str, tag: &str) -> RecomputeStats {
    apply(
        engine,
        EventKind::DeploymentVersionCreate,
        json!({
            "id": id,
            "workspace_id": WS,
            "deployment_id": "dep-1",
            "tag": tag,
            "status": "ready",
            "created_at": Utc::now()
        }),
    )
    .await
}

async fn jobs_in_environment(engine: &Engine, environment_id: &str) -> Vec<Job> {
    let handle = engine.registry().get(&WS.into()).expect("workspace loaded");
    let workspace = handle.lock().await;
    let environment_id = EnvironmentId::new(environment_id);
    workspace
        .store
        .jobs()
        .filter(|job| {
            job.release_id
                .as_ref()
                .and_then(|id| workspace.store.release(id))
                .is_some_and(|release| release.target.environment_id == environment_id)
        })
        .cloned()
        .collect()
}

async fn pending_jobs_in_environment(engine: &Engine, environment_id: &str) -> usize {
    jobs_in_environment(engine, environment_id)
        .await
        .into_iter()
        .filter(|job| job.status == JobStatus::Pending)
        .count()
}

#[tokio::test]
async fn test_approval_gating_requires_two_distinct_approvers() {
    let engine = engine();
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;
    apply(
        &engine,
        EventKind::PolicyCreate,
        json!({
            "id": "pol-1",
            "workspace_id": WS,
            "name": "two approvals",
            "rules": [{"id": "rule-approval", "rule": "any_approval", "min_approvals": 2}]
        }),
    )
    .await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    assert!(stats.created_jobs.is_empty());
    assert_eq!(pending_jobs_in_environment(&engine, "env-prod").await, 0);

    apply(
        &engine,
        EventKind::UserApprovalRecordCreate,
        json!({
            "workspace_id": WS,
            "version_id": "v-1",
            "environment_id": "env-prod",
            "user_id": "alice",
            "status": "approved",
            "created_at": Utc::now()
        }),
    )
    .await;
    assert_eq!(pending_jobs_in_environment(&engine, "env-prod").await, 0);

    let stats = apply(
        &engine,
        EventKind::UserApprovalRecordCreate,
        json!({
            "workspace_id": WS,
            "version_id": "v-1",
            "environment_id": "env-prod",
            "user_id": "bob",
            "status": "approved",
            "created_at": Utc::now()
        }),
    )
    .await;
    assert_eq!(stats.created_jobs.len(), 1);
    assert_eq!(pending_jobs_in_environment(&engine, "env-prod").await, 1);
}

#[tokio::test]
async fn test_soak_time_progression_gates_production() {
    let engine = engine();
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-staging", "staging").await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;
    apply(
        &engine,
        EventKind::PolicyCreate,
        json!({
            "id": "pol-1",
            "workspace_id": WS,
            "name": "staging first",
            "selector": {
                "environment": {"type": "tree", "root": {"type": "name", "operator": "equals", "value": "production"}}
            },
            "rules": [{
                "id": "rule-progression",
                "rule": "environment_progression",
                "depends_on": {"type": "tree", "root": {"type": "name", "operator": "equals", "value": "staging"}},
                "min_soak_minutes": 2
            }]
        }),
    )
    .await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    // Staging is unconstrained; production waits on it.
    assert_eq!(stats.created_jobs.len(), 1);
    assert_eq!(pending_jobs_in_environment(&engine, "env-staging").await, 1);
    assert_eq!(jobs_in_environment(&engine, "env-prod").await.len(), 0);

    // The staging job succeeded three minutes ago; the soak window has
    // already elapsed.
    let staging_job = jobs_in_environment(&engine, "env-staging").await.remove(0);
    {
        let handle = engine.registry().get(&WS.into()).unwrap();
        let mut workspace = handle.lock().await;
        let mut job = workspace.store.job(&staging_job.id).unwrap().clone();
        job.transition(JobStatus::Successful, Utc::now() - Duration::minutes(3))
            .unwrap();
        workspace.store.update_job(job);
    }

    engine
        .reconcile_workspace(&WS.into(), "resync")
        .await
        .unwrap();
    assert_eq!(pending_jobs_in_environment(&engine, "env-prod").await, 1);
    assert_eq!(jobs_in_environment(&engine, "env-prod").await.len(), 1);
}

#[tokio::test]
async fn test_progression_or_semantics_across_staging_environments() {
    let engine = engine();
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-staging-us-east", "staging-us-east").await;
    seed_environment(&engine, "env-staging-eu-west", "staging-eu-west").await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;
    apply(
        &engine,
        EventKind::PolicyCreate,
        json!({
            "id": "pol-1",
            "workspace_id": WS,
            "name": "any staging first",
            "selector": {
                "environment": {"type": "tree", "root": {"type": "name", "operator": "equals", "value": "production"}}
            },
            "rules": [{
                "id": "rule-progression",
                "rule": "environment_progression",
                "depends_on": {"type": "tree", "root": {"type": "name", "operator": "starts_with", "value": "staging"}}
            }]
        }),
    )
    .await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    assert_eq!(stats.created_jobs.len(), 2);
    assert_eq!(jobs_in_environment(&engine, "env-prod").await.len(), 0);

    // Completing one of the two staging environments is enough.
    let us_east_job = jobs_in_environment(&engine, "env-staging-us-east")
        .await
        .remove(0);
    apply(
        &engine,
        EventKind::JobUpdate,
        json!({"id": us_east_job.id.as_str(), "status": "in_progress"}),
    )
    .await;
    let stats = apply(
        &engine,
        EventKind::JobUpdate,
        json!({"id": us_east_job.id.as_str(), "status": "successful"}),
    )
    .await;

    assert_eq!(stats.created_jobs.len(), 1);
    assert_eq!(pending_jobs_in_environment(&engine, "env-prod").await, 1);
    assert_eq!(
        pending_jobs_in_environment(&engine, "env-staging-eu-west").await,
        1
    );
}

#[tokio::test]
async fn test_missing_job_agent_marker_then_retrigger() {
    let engine = engine();
    apply(
        &engine,
        EventKind::SystemCreate,
        json!({"id": "sys-1", "workspace_id": WS, "name": "checkout"}),
    )
    .await;
    apply(
        &engine,
        EventKind::DeploymentCreate,
        json!({"id": "dep-1", "workspace_id": WS, "system_id": "sys-1", "name": "api"}),
    )
    .await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    assert_eq!(stats.created_jobs.len(), 1);
    let marker = jobs_in_environment(&engine, "env-prod").await.remove(0);
    assert_eq!(marker.status, JobStatus::InvalidJobAgent);

    // Configuring the agent creates a fresh pending job for the same
    // release and leaves the marker in place.
    apply(
        &engine,
        EventKind::JobAgentCreate,
        json!({"id": "agent-1", "workspace_id": WS, "name": "k8s", "kind": "kubernetes"}),
    )
    .await;
    let stats = apply(
        &engine,
        EventKind::DeploymentUpdate,
        json!({
            "id": "dep-1",
            "workspace_id": WS,
            "system_id": "sys-1",
            "name": "api",
            "job_agent_id": "agent-1"
        }),
    )
    .await;
    assert_eq!(stats.created_jobs.len(), 1);

    let jobs = jobs_in_environment(&engine, "env-prod").await;
    assert_eq!(jobs.len(), 2);
    let marker_after = jobs.iter().find(|j| j.id == marker.id).unwrap();
    let pending = jobs.iter().find(|j| j.id != marker.id).unwrap();
    assert_eq!(marker_after.status, JobStatus::InvalidJobAgent);
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(marker_after.release_id, pending.release_id);
}

#[tokio::test]
async fn test_policy_skip_wildcard_resource_unblocks_environment() {
    let engine = engine();
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-prod", "production").await;
    for id in ["res-1", "res-2", "res-3"] {
        seed_resource(&engine, id).await;
    }
    apply(
        &engine,
        EventKind::PolicyCreate,
        json!({
            "id": "pol-1",
            "workspace_id": WS,
            "name": "needs approval",
            "rules": [{"id": "rule-approval", "rule": "any_approval", "min_approvals": 1}]
        }),
    )
    .await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    assert!(stats.created_jobs.is_empty());

    // A skip with no resource scope waives the rule for every resource
    // in the environment, with no approvals on record.
    let stats = apply(
        &engine,
        EventKind::PolicySkipCreate,
        json!({
            "id": "skip-1",
            "workspace_id": WS,
            "version_id": "v-1",
            "environment_id": "env-prod",
            "rule_id": "rule-approval",
            "reason": "incident hotfix",
            "created_by": "oncall",
            "created_at": Utc::now()
        }),
    )
    .await;
    assert_eq!(stats.created_jobs.len(), 3);
    assert_eq!(pending_jobs_in_environment(&engine, "env-prod").await, 3);
}

#[tokio::test]
async fn test_dispatch_context_survives_entity_mutations() {
    let engine = engine();
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-prod", "production").await;
    apply(
        &engine,
        EventKind::ResourceCreate,
        json!({
            "id": "res-1",
            "workspace_id": WS,
            "name": "cluster",
            "kind": "Kubernetes",
            "identifier": "k8s/1",
            "metadata": {"zone": "a"}
        }),
    )
    .await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    let job_id = stats.created_jobs[0].clone();

    apply(
        &engine,
        EventKind::EnvironmentUpdate,
        json!({"id": "env-prod", "workspace_id": WS, "system_id": "sys-1", "name": "staging-renamed"}),
    )
    .await;
    let stats = apply(
        &engine,
        EventKind::ResourceUpdate,
        json!({
            "id": "res-1",
            "workspace_id": WS,
            "name": "cluster",
            "kind": "Kubernetes",
            "identifier": "k8s/1",
            "metadata": {"zone": "z"}
        }),
    )
    .await;
    // Re-reconciling the mutated slice is idempotent.
    assert!(stats.created_jobs.is_empty());

    let handle = engine.registry().get(&WS.into()).unwrap();
    let workspace = handle.lock().await;
    let job = workspace.store.job(&job_id).unwrap();
    let context = &job.dispatch_context;
    assert_eq!(context.environment.as_ref().unwrap().name, "production");
    assert_eq!(context.resource.as_ref().unwrap().metadata["zone"], "a");
}

#[tokio::test]
async fn test_snapshot_round_trip_preserves_jobs_and_contexts() {
    let storage = Arc::new(InMemorySnapshotStorage::new());
    let engine = Engine::new(storage.clone());
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;
    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    let job_id = stats.created_jobs[0].clone();

    let before = {
        let handle = engine.registry().get(&WS.into()).unwrap();
        let workspace = handle.lock().await;
        serde_json::to_value(workspace.store.job(&job_id).unwrap()).unwrap()
    };

    // Evict (snapshotting to storage), then reload from the snapshot.
    engine.registry().remove(&WS.into()).await.unwrap();
    assert!(engine.registry().get(&WS.into()).is_none());

    let stats = engine
        .reconcile_workspace(&WS.into(), "restore")
        .await
        .unwrap();
    // The restored fact store re-derives the same world: no new jobs.
    assert!(stats.created_jobs.is_empty());

    let handle = engine.registry().get(&WS.into()).unwrap();
    let workspace = handle.lock().await;
    let after = serde_json::to_value(workspace.store.job(&job_id).unwrap()).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_version_template_config_round_trips_into_merged_job_config() {
    let engine = engine();
    seed_system_and_deployment(&engine).await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;

    let template = json!({
        "template": {"spec": {"containers": [{"image": "api:1.0.0", "extra": true}]}}
    });
    let stats = apply(
        &engine,
        EventKind::DeploymentVersionCreate,
        json!({
            "id": "v-1",
            "workspace_id": WS,
            "deployment_id": "dep-1",
            "tag": "1.0.0",
            "status": "ready",
            "created_at": Utc::now(),
            "job_agent_config": template.clone()
        }),
    )
    .await;

    let handle = engine.registry().get(&WS.into()).unwrap();
    let workspace = handle.lock().await;

    let version = workspace.store.version(&"v-1".into()).unwrap();
    assert_eq!(
        serde_json::to_value(&version.job_agent_config).unwrap(),
        template
    );

    // The template layer survives the three-way merge into the job.
    let job = workspace.store.job(&stats.created_jobs[0]).unwrap();
    let merged = serde_json::to_value(&job.job_agent_config).unwrap();
    assert_eq!(merged["template"], template["template"]);
}

#[tokio::test]
async fn test_workflow_run_chains_step_jobs_through_events() {
    let engine = engine();
    apply(
        &engine,
        EventKind::JobAgentCreate,
        json!({"id": "agent-1", "workspace_id": WS, "name": "runner", "kind": "kubernetes"}),
    )
    .await;
    apply(
        &engine,
        EventKind::WorkflowTemplateCreate,
        json!({
            "id": "tmpl-1",
            "workspace_id": WS,
            "name": "migrate",
            "inputs": [{"name": "database"}],
            "step_templates": [
                {"name": "backup", "job_agent_id": "agent-1"},
                {"name": "migrate", "job_agent_id": "agent-1"}
            ]
        }),
    )
    .await;
    apply(
        &engine,
        EventKind::WorkflowCreate,
        json!({
            "id": "wf-1",
            "workspace_id": WS,
            "template_id": "tmpl-1",
            "name": "migrate orders",
            "inputs": {"database": "orders"}
        }),
    )
    .await;
    apply(
        &engine,
        EventKind::WorkflowRunCreate,
        json!({"id": "run-1", "workflow_id": "wf-1"}),
    )
    .await;

    let first_job = {
        let handle = engine.registry().get(&WS.into()).unwrap();
        let workspace = handle.lock().await;
        let steps = workspace.store.steps_for_run(&"run-1".into());
        assert_eq!(steps.len(), 2);
        assert!(steps[1].job_id.is_none());
        steps[0].job_id.clone().unwrap()
    };

    apply(
        &engine,
        EventKind::JobUpdate,
        json!({"id": first_job.as_str(), "status": "successful"}),
    )
    .await;
    let second_job = {
        let handle = engine.registry().get(&WS.into()).unwrap();
        let workspace = handle.lock().await;
        let steps = workspace.store.steps_for_run(&"run-1".into());
        steps[1].job_id.clone().expect("second step started")
    };

    apply(
        &engine,
        EventKind::JobUpdate,
        json!({"id": second_job.as_str(), "status": "successful"}),
    )
    .await;
    let handle = engine.registry().get(&WS.into()).unwrap();
    let workspace = handle.lock().await;
    let run = workspace.store.workflow_run(&"run-1".into()).unwrap();
    assert_eq!(run.status, keel_types::WorkflowRunStatus::Completed);
    assert!(run.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_verification_gates_current_release() {
    let engine = engine();
    apply(
        &engine,
        EventKind::SystemCreate,
        json!({"id": "sys-1", "workspace_id": WS, "name": "checkout"}),
    )
    .await;
    apply(
        &engine,
        EventKind::JobAgentCreate,
        json!({"id": "agent-1", "workspace_id": WS, "name": "k8s", "kind": "kubernetes"}),
    )
    .await;
    apply(
        &engine,
        EventKind::DeploymentCreate,
        json!({
            "id": "dep-1",
            "workspace_id": WS,
            "system_id": "sys-1",
            "name": "api",
            "job_agent_id": "agent-1",
            "verification_metrics": [{
                "name": "health",
                "interval_seconds": 1,
                "count": 2,
                "success_condition": "result.ok == true",
                "provider": {"type": "sleep", "duration_seconds": 1}
            }]
        }),
    )
    .await;
    seed_environment(&engine, "env-prod", "production").await;
    seed_resource(&engine, "res-1").await;

    let stats = seed_version(&engine, "v-1", "1.0.0").await;
    let job_id = stats.created_jobs[0].clone();
    let target_key = "res-1-env-prod-dep-1";

    apply(
        &engine,
        EventKind::JobUpdate,
        json!({"id": job_id.as_str(), "status": "in_progress"}),
    )
    .await;
    apply(
        &engine,
        EventKind::JobUpdate,
        json!({"id": job_id.as_str(), "status": "successful"}),
    )
    .await;

    // Success alone is not enough while a verification is running.
    {
        let handle = engine.registry().get(&WS.into()).unwrap();
        let workspace = handle.lock().await;
        assert!(current_release_for_target(&workspace.store, target_key).is_none());
    }

    // Drive the verification to resolution; the release becomes
    // current only now.
    engine.pump_verification().await.unwrap().unwrap();
    let handle = engine.registry().get(&WS.into()).unwrap();
    let workspace = handle.lock().await;
    let current = current_release_for_target(&workspace.store, target_key).unwrap();
    assert_eq!(current.version_id.as_str(), "v-1");
    let verification = workspace.store.verification_for_job(&job_id).unwrap();
    assert_eq!(
        verification.status,
        keel_types::VerificationStatus::Passed
    );
}
