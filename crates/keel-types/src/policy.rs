//! Policies, rules, skips, and approval records

use crate::selector::{Selector, TargetSelector};
use crate::{EnvironmentId, PolicyId, ResourceId, RuleId, SkipId, UserId, VersionId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A policy: a target scope plus a set of rules. A target progresses
/// only when every applicable rule of every applicable policy allows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy identifier
    pub id: PolicyId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// Which (deployment, environment, resource) triples it governs
    #[serde(default)]
    pub selector: TargetSelector,

    /// Rules evaluated for each candidate version
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    pub fn new(
        id: impl Into<PolicyId>,
        workspace_id: impl Into<WorkspaceId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            selector: TargetSelector::any(),
            rules: Vec::new(),
        }
    }

    pub fn with_selector(mut self, selector: TargetSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// One rule inside a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique rule identifier; skips reference it
    pub id: RuleId,

    /// Rule behaviour
    #[serde(flatten)]
    pub kind: PolicyRuleKind,
}

impl PolicyRule {
    pub fn new(id: impl Into<RuleId>, kind: PolicyRuleKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Rule behaviours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PolicyRuleKind {
    /// Requires at least `min_approvals` distinct approvals for the
    /// (version, environment) pair.
    AnyApproval { min_approvals: u32 },

    /// Admits only versions the selector matches.
    VersionSelector { selector: Selector },

    /// Requires the candidate version to have succeeded in at least one
    /// dependency environment, optionally with soak/percentage/age
    /// windows. Success percentage is computed over all of the
    /// deployment's release targets in the dependency environments.
    EnvironmentProgression {
        depends_on: Selector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_soak_minutes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_success_percentage: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_age_hours: Option<u64>,
    },

    /// Staggers targets in lexicographic key order, one interval apart.
    GradualRollout { time_scale_interval_seconds: u64 },
}

/// Time-bounded waiver converting Block/Pending to Allow for one rule
/// and one version. Nil environment and/or resource act as wildcards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySkip {
    /// Unique skip identifier
    pub id: SkipId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Version being waived
    pub version_id: VersionId,

    /// Environment scope; absent means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<EnvironmentId>,

    /// Resource scope; absent means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,

    /// Rule being waived
    pub rule_id: RuleId,

    /// Why the waiver exists
    pub reason: String,

    /// Who created it
    pub created_by: UserId,

    pub created_at: DateTime<Utc>,

    /// Expiry; absent means no expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PolicySkip {
    /// Whether the skip waives `rule_id` for the given triple at `now`.
    pub fn waives(
        &self,
        version_id: &VersionId,
        environment_id: &EnvironmentId,
        resource_id: &ResourceId,
        rule_id: &RuleId,
        now: DateTime<Utc>,
    ) -> bool {
        if &self.version_id != version_id || &self.rule_id != rule_id {
            return false;
        }
        if let Some(env) = &self.environment_id {
            if env != environment_id {
                return false;
            }
        }
        if let Some(res) = &self.resource_id {
            if res != resource_id {
                return false;
            }
        }
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

/// Approval state for a (version, environment, user) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

/// One user's approval verdict on a version for an environment. Keyed
/// by (version, environment, user): a user changing their mind replaces
/// the prior record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserApprovalRecord {
    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Version the verdict applies to
    pub version_id: VersionId,

    /// Environment the verdict applies to
    pub environment_id: EnvironmentId,

    /// Approving or rejecting user
    pub user_id: UserId,

    /// The verdict
    pub status: ApprovalStatus,

    pub created_at: DateTime<Utc>,
}

impl UserApprovalRecord {
    /// Store key: one record per (version, environment, user).
    pub fn store_key(
        version_id: &VersionId,
        environment_id: &EnvironmentId,
        user_id: &UserId,
    ) -> String {
        format!("{version_id}:{environment_id}:{user_id}")
    }
}
