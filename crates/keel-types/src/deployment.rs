//! Deployments and deployment versions

use crate::config::ConfigMap;
use crate::selector::Selector;
use crate::verification::VerificationMetricSpec;
use crate::{DeploymentId, JobAgentId, SystemId, VersionId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// A deployable unit. Its resource selector, together with environment
/// selectors and system links, determines the release targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment identifier
    pub id: DeploymentId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Owning system
    pub system_id: SystemId,

    /// Display name
    pub name: String,

    /// Agent that executes jobs for this deployment. Unset means jobs
    /// are created as `InvalidJobAgent` markers until one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_agent_id: Option<JobAgentId>,

    /// Deployment-level agent config override (merge middle layer)
    #[serde(default)]
    pub job_agent_config: ConfigMap,

    /// Which resources this deployment may run on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,

    /// Post-success verification applied to every release of this
    /// deployment; frozen into the release at materialization time.
    #[serde(default)]
    pub verification_metrics: Vec<VerificationMetricSpec>,

    /// Additional systems this deployment is linked into
    #[serde(default)]
    pub linked_systems: BTreeSet<SystemId>,
}

impl Deployment {
    pub fn new(
        id: impl Into<DeploymentId>,
        workspace_id: impl Into<WorkspaceId>,
        system_id: impl Into<SystemId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            system_id: system_id.into(),
            name: name.into(),
            job_agent_id: None,
            job_agent_config: ConfigMap::new(),
            resource_selector: None,
            verification_metrics: Vec::new(),
            linked_systems: BTreeSet::new(),
        }
    }

    /// Systems this deployment belongs to: the owner plus explicit links.
    pub fn system_ids(&self) -> impl Iterator<Item = &SystemId> {
        std::iter::once(&self.system_id).chain(self.linked_systems.iter())
    }
}

/// Lifecycle status of a deployment version. Only `Ready` versions are
/// candidates for a desired release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Candidate for release
    Ready,
    /// Still being produced upstream
    Building,
    /// Build or validation failed
    Failed,
    /// Explicitly withdrawn from rollout
    Rejected,
}

/// One releasable version of a deployment. Tags are not necessarily
/// unique; ids are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    /// Unique version identifier
    pub id: VersionId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Deployment this version belongs to
    pub deployment_id: DeploymentId,

    /// Human-facing tag, e.g. "1.0.0"
    pub tag: String,

    /// Lifecycle status
    pub status: VersionStatus,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Schemaless version config; unknown keys round-trip
    #[serde(default)]
    pub config: ConfigMap,

    /// Version-level agent config override (merge top layer)
    #[serde(default)]
    pub job_agent_config: ConfigMap,

    /// Creation time; orders candidates newest-first
    pub created_at: DateTime<Utc>,
}

impl DeploymentVersion {
    pub fn new(
        id: impl Into<VersionId>,
        workspace_id: impl Into<WorkspaceId>,
        deployment_id: impl Into<DeploymentId>,
        tag: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            deployment_id: deployment_id.into(),
            tag: tag.into(),
            status: VersionStatus::Ready,
            metadata: BTreeMap::new(),
            config: ConfigMap::new(),
            job_agent_config: ConfigMap::new(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_config_round_trips_unknown_keys() {
        let raw = json!({
            "id": "v-1",
            "workspace_id": "ws-1",
            "deployment_id": "dep-1",
            "tag": "1.0.0",
            "status": "ready",
            "created_at": "2026-01-01T00:00:00Z",
            "job_agent_config": {
                "template": {"custom": {"deeply": ["nested", 1, true]}}
            }
        });

        let version: DeploymentVersion = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&version).unwrap();
        assert_eq!(back["job_agent_config"], raw["job_agent_config"]);
    }

    #[test]
    fn test_system_ids_include_links() {
        let mut deployment = Deployment::new("dep-1", "ws-1", "sys-1", "api");
        deployment.linked_systems.insert(SystemId::new("sys-2"));

        let ids: Vec<_> = deployment.system_ids().map(|s| s.as_str()).collect();
        assert_eq!(ids, vec!["sys-1", "sys-2"]);
    }
}
