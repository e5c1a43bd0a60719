//! Rule verdicts and the aggregated target decision

use chrono::{DateTime, Utc};
use keel_types::{PolicyId, RuleId};
use serde::{Deserialize, Serialize};

/// Outcome of one rule for one (target, version) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleVerdict {
    /// The rule permits progression
    Allow,

    /// The rule forbids progression; only a fact change can clear it
    Block {
        /// Why the rule blocked
        reason: String,
    },

    /// The rule will permit progression at a known future time
    Pending {
        /// Earliest instant the rule can allow
        until: DateTime<Utc>,
    },
}

impl RuleVerdict {
    pub fn allow() -> Self {
        Self::Allow
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
        }
    }

    pub fn pending(until: DateTime<Utc>) -> Self {
        Self::Pending { until }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Block { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending { until } => Some(*until),
            _ => None,
        }
    }
}

/// One evaluated rule, for the reconciliation trace.
#[derive(Debug, Clone, Serialize)]
pub struct RuleCheck {
    /// Policy the rule belongs to
    pub policy_id: PolicyId,

    /// Rule that was evaluated
    pub rule_id: RuleId,

    /// Rule kind label, e.g. "any_approval"
    pub rule_kind: &'static str,

    /// The verdict, after skip waivers
    pub verdict: RuleVerdict,

    /// Whether a policy skip converted a non-allow verdict
    pub waived: bool,
}

/// Aggregated decision for one (target, version) pair: every applicable
/// rule of every applicable policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetDecision {
    pub checks: Vec<RuleCheck>,
}

impl TargetDecision {
    /// Permitted iff every applicable rule allowed.
    pub fn permitted(&self) -> bool {
        self.checks.iter().all(|c| c.verdict.is_allowed())
    }

    /// Any block takes precedence over pending verdicts.
    pub fn blocked(&self) -> bool {
        self.checks.iter().any(|c| c.verdict.is_blocked())
    }

    /// Earliest wake-up among pending rules, when nothing blocks.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        if self.blocked() {
            return None;
        }
        self.checks.iter().filter_map(|c| c.verdict.until()).min()
    }

    /// First blocking reason, for traces.
    pub fn block_reason(&self) -> Option<&str> {
        self.checks.iter().find_map(|c| c.verdict.reason())
    }
}
