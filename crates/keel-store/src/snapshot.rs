//! Workspace snapshots
//!
//! A snapshot captures every entity collection; derived indexes are
//! never serialized and are rebuilt from scratch on load. Payload
//! integrity is guarded by a hash computed over the encoded data
//! section.

use crate::error::{Result, SnapshotError};
use crate::store::{OwnedStoreCollections, WorkspaceStore};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_types::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Environment,
    GithubEntity, Job, JobAgent, JobVerification, Policy, PolicySkip, RelationshipRule, Release,
    Resource, ResourceProvider, ResourceVariable, System, UserApprovalRecord, Workflow,
    WorkflowRun, WorkflowStep, WorkflowTemplate, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Snapshot format version; bumped on breaking layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Metadata about a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Workspace the snapshot is for.
    pub workspace_id: WorkspaceId,

    /// Snapshot format version.
    pub version: u32,

    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,

    /// Total entity count across all collections.
    pub entity_count: usize,

    /// Base64 sha256 over the encoded data section.
    pub integrity_hash: String,
}

/// Every persisted entity collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    #[serde(default)]
    pub systems: Vec<System>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub resource_providers: Vec<ResourceProvider>,
    #[serde(default)]
    pub job_agents: Vec<JobAgent>,
    #[serde(default)]
    pub versions: Vec<DeploymentVersion>,
    #[serde(default)]
    pub variables: Vec<DeploymentVariable>,
    #[serde(default)]
    pub variable_values: Vec<DeploymentVariableValue>,
    #[serde(default)]
    pub resource_variables: Vec<ResourceVariable>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub policy_skips: Vec<PolicySkip>,
    #[serde(default)]
    pub approvals: Vec<UserApprovalRecord>,
    #[serde(default)]
    pub relationship_rules: Vec<RelationshipRule>,
    #[serde(default)]
    pub github_entities: Vec<GithubEntity>,
    #[serde(default)]
    pub releases: Vec<Release>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub verifications: Vec<JobVerification>,
    #[serde(default)]
    pub workflow_templates: Vec<WorkflowTemplate>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRun>,
    #[serde(default)]
    pub workflow_steps: Vec<WorkflowStep>,
}

impl SnapshotData {
    fn entity_count(&self) -> usize {
        self.systems.len()
            + self.deployments.len()
            + self.environments.len()
            + self.resources.len()
            + self.resource_providers.len()
            + self.job_agents.len()
            + self.versions.len()
            + self.variables.len()
            + self.variable_values.len()
            + self.resource_variables.len()
            + self.policies.len()
            + self.policy_skips.len()
            + self.approvals.len()
            + self.relationship_rules.len()
            + self.github_entities.len()
            + self.releases.len()
            + self.jobs.len()
            + self.verifications.len()
            + self.workflow_templates.len()
            + self.workflows.len()
            + self.workflow_runs.len()
            + self.workflow_steps.len()
    }
}

/// Complete serialized workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub metadata: SnapshotMetadata,
    pub data: SnapshotData,
}

impl WorkspaceSnapshot {
    /// Capture every collection of `store`.
    pub fn capture(store: &WorkspaceStore, now: DateTime<Utc>) -> Result<Self> {
        let collections = store.collections();
        let data = SnapshotData {
            systems: collections.systems.values().cloned().collect(),
            deployments: collections.deployments.values().cloned().collect(),
            environments: collections.environments.values().cloned().collect(),
            resources: collections.resources.values().cloned().collect(),
            resource_providers: collections.resource_providers.values().cloned().collect(),
            job_agents: collections.job_agents.values().cloned().collect(),
            versions: collections.versions.values().cloned().collect(),
            variables: collections.variables.values().cloned().collect(),
            variable_values: collections.variable_values.values().cloned().collect(),
            resource_variables: collections.resource_variables.values().cloned().collect(),
            policies: collections.policies.values().cloned().collect(),
            policy_skips: collections.policy_skips.values().cloned().collect(),
            approvals: collections.approvals.values().cloned().collect(),
            relationship_rules: collections.relationship_rules.values().cloned().collect(),
            github_entities: collections.github_entities.values().cloned().collect(),
            releases: collections.releases.values().cloned().collect(),
            jobs: collections.jobs.values().cloned().collect(),
            verifications: collections.verifications.values().cloned().collect(),
            workflow_templates: collections.workflow_templates.values().cloned().collect(),
            workflows: collections.workflows.values().cloned().collect(),
            workflow_runs: collections.workflow_runs.values().cloned().collect(),
            workflow_steps: collections.workflow_steps.values().cloned().collect(),
        };

        let integrity_hash = hash_data(&data)?;
        let entity_count = data.entity_count();
        Ok(Self {
            metadata: SnapshotMetadata {
                workspace_id: store.workspace_id().clone(),
                version: SNAPSHOT_VERSION,
                created_at: now,
                entity_count,
                integrity_hash,
            },
            data,
        })
    }

    /// Rebuild a store, verifying integrity first. Derived indexes are
    /// the engine's responsibility to rematerialize.
    pub fn restore(&self) -> Result<WorkspaceStore> {
        let expected = hash_data(&self.data)?;
        if expected != self.metadata.integrity_hash {
            return Err(SnapshotError::IntegrityMismatch {
                expected,
                actual: self.metadata.integrity_hash.clone(),
            });
        }

        let mut collections = OwnedStoreCollections::default();
        for entity in &self.data.systems {
            collections.systems.insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.deployments {
            collections
                .deployments
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.environments {
            collections
                .environments
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.resources {
            collections
                .resources
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.resource_providers {
            collections
                .resource_providers
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.job_agents {
            collections
                .job_agents
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.versions {
            collections
                .versions
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.variables {
            collections
                .variables
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.variable_values {
            collections
                .variable_values
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.resource_variables {
            collections.resource_variables.insert(
                ResourceVariable::store_key(&entity.resource_id, &entity.key),
                entity.clone(),
            );
        }
        for entity in &self.data.policies {
            collections
                .policies
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.policy_skips {
            collections
                .policy_skips
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.approvals {
            collections.approvals.insert(
                UserApprovalRecord::store_key(
                    &entity.version_id,
                    &entity.environment_id,
                    &entity.user_id,
                ),
                entity.clone(),
            );
        }
        for entity in &self.data.relationship_rules {
            collections
                .relationship_rules
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.github_entities {
            collections
                .github_entities
                .insert(entity.key(), entity.clone());
        }
        for entity in &self.data.releases {
            collections
                .releases
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.jobs {
            collections.jobs.insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.verifications {
            collections
                .verifications
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.workflow_templates {
            collections
                .workflow_templates
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.workflows {
            collections
                .workflows
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.workflow_runs {
            collections
                .workflow_runs
                .insert(entity.id.clone(), entity.clone());
        }
        for entity in &self.data.workflow_steps {
            collections
                .workflow_steps
                .insert(entity.id.clone(), entity.clone());
        }

        Ok(WorkspaceStore::from_collections(
            self.metadata.workspace_id.clone(),
            collections,
        ))
    }
}

fn hash_data(data: &SnapshotData) -> Result<String> {
    let encoded = serde_json::to_vec(data).map_err(SnapshotError::Encode)?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(BASE64.encode(hasher.finalize()))
}

/// Persistence seam for snapshots.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Persist a snapshot, replacing any prior one for the workspace.
    async fn save(&self, snapshot: WorkspaceSnapshot) -> Result<()>;

    /// Load the latest snapshot for a workspace, if any.
    async fn load(&self, workspace_id: &WorkspaceId) -> Result<Option<WorkspaceSnapshot>>;

    /// Drop the stored snapshot for a workspace.
    async fn remove(&self, workspace_id: &WorkspaceId) -> Result<()>;
}

/// In-memory snapshot backend for development and tests.
#[derive(Default)]
pub struct InMemorySnapshotStorage {
    snapshots: DashMap<WorkspaceId, WorkspaceSnapshot>,
}

impl InMemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStorage for InMemorySnapshotStorage {
    async fn save(&self, snapshot: WorkspaceSnapshot) -> Result<()> {
        self.snapshots
            .insert(snapshot.metadata.workspace_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, workspace_id: &WorkspaceId) -> Result<Option<WorkspaceSnapshot>> {
        Ok(self.snapshots.get(workspace_id).map(|s| s.clone()))
    }

    async fn remove(&self, workspace_id: &WorkspaceId) -> Result<()> {
        self.snapshots.remove(workspace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{Resource, System};

    fn populated_store() -> WorkspaceStore {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_system(System::new("sys-1", "ws-1", "checkout"));
        store.upsert_resource(
            Resource::new("res-1", "ws-1", "cluster", "Kubernetes", "k8s/1")
                .with_metadata("region", "us-east-1"),
        );
        store.drain_changes();
        store
    }

    #[test]
    fn test_capture_restore_round_trip() {
        let store = populated_store();
        let snapshot = WorkspaceSnapshot::capture(&store, Utc::now()).unwrap();
        assert_eq!(snapshot.metadata.entity_count, 2);

        let restored = snapshot.restore().unwrap();
        assert_eq!(
            restored.resource(&"res-1".into()).unwrap().metadata["region"],
            "us-east-1"
        );
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let store = populated_store();
        let mut snapshot = WorkspaceSnapshot::capture(&store, Utc::now()).unwrap();
        snapshot.data.systems[0].name = "tampered".to_string();

        let err = snapshot.restore().unwrap_err();
        assert!(matches!(err, SnapshotError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        let storage = InMemorySnapshotStorage::new();
        let store = populated_store();
        let snapshot = WorkspaceSnapshot::capture(&store, Utc::now()).unwrap();

        storage.save(snapshot).await.unwrap();
        let loaded = storage.load(&WorkspaceId::new("ws-1")).await.unwrap();
        assert!(loaded.is_some());

        storage.remove(&WorkspaceId::new("ws-1")).await.unwrap();
        assert!(storage
            .load(&WorkspaceId::new("ws-1"))
            .await
            .unwrap()
            .is_none());
    }
}
