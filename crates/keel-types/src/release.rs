//! Release targets and releases

use crate::config::ConfigMap;
use crate::verification::VerificationMetricSpec;
use crate::{DeploymentId, EnvironmentId, ReleaseId, ResourceId, VersionId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A (deployment, environment, resource) triple the engine converges as
/// a unit. Derived from selectors; never persisted as a first-class
/// entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub deployment_id: DeploymentId,
    pub environment_id: EnvironmentId,
    pub resource_id: ResourceId,
}

impl ReleaseTarget {
    pub fn new(
        deployment_id: impl Into<DeploymentId>,
        environment_id: impl Into<EnvironmentId>,
        resource_id: impl Into<ResourceId>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            environment_id: environment_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Stable key: `resource.id-environment.id-deployment.id`.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.resource_id, self.environment_id, self.deployment_id
        )
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Frozen combination of a release target and a version: resolved
/// variables, merged agent config, and verification specs, captured at
/// materialization time. Immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Unique release identifier
    pub id: ReleaseId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Target this release converges
    pub target: ReleaseTarget,

    /// Version being released
    pub version_id: VersionId,

    /// Variables frozen at materialization
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Three-way merged agent config frozen at materialization
    #[serde(default)]
    pub job_agent_config: ConfigMap,

    /// Verification frozen from the deployment at materialization
    #[serde(default)]
    pub verification_metrics: Vec<VerificationMetricSpec>,

    /// Materialization time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key_format() {
        let target = ReleaseTarget::new("dep-1", "env-1", "res-1");
        assert_eq!(target.key(), "res-1-env-1-dep-1");
    }

    #[test]
    fn test_target_ordering_is_stable() {
        let a = ReleaseTarget::new("dep", "env", "res-a");
        let b = ReleaseTarget::new("dep", "env", "res-b");
        assert!(a < b);
    }
}
