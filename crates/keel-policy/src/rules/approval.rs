//! Any-approval rule
//!
//! Counts distinct approved records for the (version, environment)
//! pair. Rejections never count, and a user flipping a prior approval
//! to rejection moves the count down because records are keyed by
//! (version, environment, user).

use crate::context::PolicyEvalContext;
use crate::verdict::RuleVerdict;
use keel_types::{ApprovalStatus, DeploymentVersion, ReleaseTarget};

pub fn evaluate(
    ctx: &PolicyEvalContext<'_>,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
    min_approvals: u32,
) -> RuleVerdict {
    let approved = ctx
        .store
        .approvals_for(&version.id, &target.environment_id)
        .filter(|record| record.status == ApprovalStatus::Approved)
        .count() as u32;

    if approved >= min_approvals {
        RuleVerdict::allow()
    } else {
        RuleVerdict::block(format!(
            "{approved} of {min_approvals} required approvals for version {}",
            version.tag
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_index::ReleaseTargetIndex;
    use keel_selector::SelectorEngine;
    use keel_store::WorkspaceStore;
    use keel_types::UserApprovalRecord;

    fn approval(user: &str, status: ApprovalStatus) -> UserApprovalRecord {
        UserApprovalRecord {
            workspace_id: "ws-1".into(),
            version_id: "v-1".into(),
            environment_id: "env-prod".into(),
            user_id: user.into(),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rejections_and_flips_do_not_count() {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_approval(approval("alice", ApprovalStatus::Approved));
        store.upsert_approval(approval("bob", ApprovalStatus::Rejected));
        store.drain_changes();

        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());
        let target = ReleaseTarget::new("dep-1", "env-prod", "res-1");
        let version = DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", Utc::now());

        assert!(evaluate(&ctx, &target, &version, 2).is_blocked());

        // Alice revokes: the upsert replaces her approval
        store.upsert_approval(approval("alice", ApprovalStatus::Rejected));
        store.drain_changes();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());
        assert!(evaluate(&ctx, &target, &version, 1).is_blocked());
    }

    #[test]
    fn test_enough_distinct_approvals_allow() {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_approval(approval("alice", ApprovalStatus::Approved));
        store.upsert_approval(approval("bob", ApprovalStatus::Approved));
        store.drain_changes();

        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());
        let target = ReleaseTarget::new("dep-1", "env-prod", "res-1");
        let version = DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", Utc::now());

        assert!(evaluate(&ctx, &target, &version, 2).is_allowed());
    }
}
