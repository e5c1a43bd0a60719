//! Gradual-rollout rule
//!
//! Staggers the targets of a (deployment, environment) pair one
//! interval apart. Target order is lexicographic by release-target key,
//! which is stable across runs and independent of insertion order. The
//! rollout clock starts at the candidate version's creation time.

use crate::context::PolicyEvalContext;
use crate::verdict::RuleVerdict;
use chrono::Duration;
use keel_types::{DeploymentVersion, ReleaseTarget};

pub fn evaluate(
    ctx: &PolicyEvalContext<'_>,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
    time_scale_interval_seconds: u64,
) -> RuleVerdict {
    let mut keys: Vec<String> = ctx
        .targets
        .for_deployment(&target.deployment_id)
        .into_iter()
        .filter(|t| t.environment_id == target.environment_id)
        .map(|t| t.key())
        .collect();
    keys.sort();

    let Some(index) = keys.iter().position(|k| k == &target.key()) else {
        return RuleVerdict::block("target not materialized in rollout window");
    };

    let offset = Duration::seconds(time_scale_interval_seconds as i64 * index as i64);
    let eligible_at = version.created_at + offset;
    if ctx.now >= eligible_at {
        RuleVerdict::allow()
    } else {
        RuleVerdict::pending(eligible_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_index::ReleaseTargetIndex;
    use keel_selector::SelectorEngine;
    use keel_store::WorkspaceStore;
    use keel_types::{Deployment, Environment, Resource, System};

    fn seeded() -> (WorkspaceStore, ReleaseTargetIndex, SelectorEngine) {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_system(System::new("sys-1", "ws-1", "checkout"));
        store.upsert_deployment(Deployment::new("dep-1", "ws-1", "sys-1", "api"));
        store.upsert_environment(Environment::new("env-prod", "ws-1", "sys-1", "production"));
        for id in ["res-a", "res-b", "res-c"] {
            store.upsert_resource(Resource::new(id, "ws-1", id, "Kubernetes", id));
        }
        store.drain_changes();

        let selectors = SelectorEngine::with_basic_evaluator();
        let mut targets = ReleaseTargetIndex::new();
        targets.recompute(&store, &selectors);
        (store, targets, selectors)
    }

    #[test]
    fn test_first_target_rolls_immediately_later_targets_wait() {
        let (store, targets, selectors) = seeded();
        let now = Utc::now();
        let version = DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", now);
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, now);

        // Lexicographic by key: res-a first
        let first = ReleaseTarget::new("dep-1", "env-prod", "res-a");
        assert!(evaluate(&ctx, &first, &version, 300).is_allowed());

        let second = ReleaseTarget::new("dep-1", "env-prod", "res-b");
        let verdict = evaluate(&ctx, &second, &version, 300);
        assert!(verdict.is_pending());
        assert_eq!(verdict.until().unwrap(), now + Duration::seconds(300));

        let third = ReleaseTarget::new("dep-1", "env-prod", "res-c");
        assert_eq!(
            evaluate(&ctx, &third, &version, 300).until().unwrap(),
            now + Duration::seconds(600)
        );
    }

    #[test]
    fn test_whole_window_open_after_enough_time() {
        let (store, targets, selectors) = seeded();
        let created = Utc::now() - Duration::seconds(3600);
        let version = DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", created);
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());

        for res in ["res-a", "res-b", "res-c"] {
            let target = ReleaseTarget::new("dep-1", "env-prod", res);
            assert!(evaluate(&ctx, &target, &version, 300).is_allowed());
        }
    }
}
