//! Dispatch context snapshots
//!
//! A job's dispatch context is the frozen world-view the executor runs
//! with. Everything is deep-copied at creation; later mutations to the
//! live entities never reach a dispatched job.

use keel_store::WorkspaceStore;
use keel_types::{
    DeploymentVersion, DispatchContext, JobAgent, ReleaseTarget, WorkflowDispatchContext,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Snapshot the entities a release job dispatches with.
pub fn release_dispatch_context(
    store: &WorkspaceStore,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
    agent: Option<&JobAgent>,
    variables: &BTreeMap<String, Value>,
) -> DispatchContext {
    DispatchContext {
        environment: store.environment(&target.environment_id).cloned(),
        resource: store.resource(&target.resource_id).cloned(),
        deployment: store.deployment(&target.deployment_id).cloned(),
        job_agent: agent.cloned(),
        version: Some(version.clone()),
        variables: variables.clone(),
        workflow: None,
    }
}

/// Snapshot the context a workflow-step job dispatches with.
pub fn workflow_dispatch_context(
    agent: Option<&JobAgent>,
    workflow: WorkflowDispatchContext,
) -> DispatchContext {
    DispatchContext {
        environment: None,
        resource: None,
        deployment: None,
        job_agent: agent.cloned(),
        version: None,
        variables: BTreeMap::new(),
        workflow: Some(workflow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_types::{Environment, Resource};

    #[test]
    fn test_snapshot_survives_entity_mutation() {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_environment(Environment::new("env-1", "ws-1", "sys-1", "production"));
        store.upsert_resource(
            Resource::new("res-1", "ws-1", "cluster", "Kubernetes", "k8s/1")
                .with_metadata("zone", "a"),
        );
        store.drain_changes();

        let target = ReleaseTarget::new("dep-1", "env-1", "res-1");
        let version = DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", Utc::now());
        let context =
            release_dispatch_context(&store, &target, &version, None, &BTreeMap::new());

        // Rename the environment and rewrite the resource metadata
        store.upsert_environment(Environment::new("env-1", "ws-1", "sys-1", "staging-renamed"));
        let mut resource = store.resource(&"res-1".into()).unwrap().clone();
        resource.metadata.insert("zone".to_string(), "z".to_string());
        store.upsert_resource(resource);
        store.drain_changes();

        assert_eq!(context.environment.as_ref().unwrap().name, "production");
        assert_eq!(context.resource.as_ref().unwrap().metadata["zone"], "a");
    }
}
