//! Environment-progression rule
//!
//! The candidate version must already have succeeded in at least one
//! environment admitted by `depends_on` (OR-semantics across dependency
//! environments). Success means a terminally successful job whose
//! verification, if one ran, passed. Success percentage is computed
//! over all of the deployment's release targets in the dependency
//! environments.

use crate::context::PolicyEvalContext;
use crate::verdict::RuleVerdict;
use chrono::Duration;
use keel_selector::SelectorSubject;
use keel_types::{
    DeploymentVersion, EnvironmentId, Job, JobStatus, ReleaseTarget, Selector, VerificationStatus,
};
use std::collections::BTreeSet;

pub struct ProgressionParams<'a> {
    pub depends_on: &'a Selector,
    pub min_soak_minutes: Option<u64>,
    pub min_success_percentage: Option<f64>,
    pub max_age_hours: Option<u64>,
}

pub fn evaluate(
    ctx: &PolicyEvalContext<'_>,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
    params: &ProgressionParams<'_>,
) -> RuleVerdict {
    let dependency_envs: BTreeSet<EnvironmentId> = ctx
        .store
        .environments()
        .filter(|e| {
            ctx.selectors
                .admits(params.depends_on, &SelectorSubject::environment(e))
        })
        .map(|e| e.id.clone())
        .collect();

    if dependency_envs.is_empty() {
        return RuleVerdict::block("no environments admitted by depends_on selector");
    }

    let attempts: Vec<&Job> = ctx
        .store
        .jobs_for_version_in_environments(&target.deployment_id, &version.id, &dependency_envs)
        .into_iter()
        .filter(|job| job.status.is_terminal())
        .collect();

    let successes: Vec<&Job> = attempts
        .iter()
        .copied()
        .filter(|job| is_verified_success(ctx, job))
        .collect();

    if successes.is_empty() {
        return RuleVerdict::block(format!(
            "version {} has no verified success in any dependency environment",
            version.tag
        ));
    }

    if let Some(threshold) = params.min_success_percentage {
        let ratio = successes.len() as f64 / attempts.len() as f64;
        if ratio < threshold {
            return RuleVerdict::block(format!(
                "success ratio {:.2} below required {:.2}",
                ratio, threshold
            ));
        }
    }

    if let Some(soak_minutes) = params.min_soak_minutes {
        let soak = Duration::minutes(soak_minutes as i64);
        let oldest_completion = successes
            .iter()
            .filter_map(|job| job.completed_at)
            .min();
        match oldest_completion {
            Some(completed_at) if completed_at + soak <= ctx.now => {}
            Some(completed_at) => {
                // The oldest success finishes soaking first.
                return RuleVerdict::pending(completed_at + soak);
            }
            None => {
                return RuleVerdict::block("successful jobs carry no completion time");
            }
        }
    }

    if let Some(max_age_hours) = params.max_age_hours {
        let horizon = ctx.now - Duration::hours(max_age_hours as i64);
        let fresh = successes
            .iter()
            .filter_map(|job| job.completed_at)
            .any(|completed_at| completed_at >= horizon);
        if !fresh {
            return RuleVerdict::block(format!(
                "no dependency success within the last {max_age_hours}h"
            ));
        }
    }

    RuleVerdict::allow()
}

/// A job counts as a success only when its verification, if any,
/// passed. A running verification keeps the job out of the success set
/// until it resolves.
fn is_verified_success(ctx: &PolicyEvalContext<'_>, job: &Job) -> bool {
    if job.status != JobStatus::Successful {
        return false;
    }
    match ctx.store.verification_for_job(&job.id) {
        Some(verification) => verification.status == VerificationStatus::Passed,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_index::ReleaseTargetIndex;
    use keel_selector::SelectorEngine;
    use keel_store::WorkspaceStore;
    use keel_types::{
        ConditionNode, ConditionOperator, DispatchContext, Environment, Release, ReleaseId,
    };

    fn seed_store(staging_job_status: JobStatus, completed_ago_minutes: i64) -> WorkspaceStore {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_environment(Environment::new("env-staging", "ws-1", "sys-1", "staging"));
        store.upsert_environment(Environment::new("env-prod", "ws-1", "sys-1", "production"));

        let now = Utc::now();
        let staging_target = ReleaseTarget::new("dep-1", "env-staging", "res-1");
        store.insert_release(Release {
            id: ReleaseId::new("rel-staging"),
            workspace_id: "ws-1".into(),
            target: staging_target,
            version_id: "v-1".into(),
            variables: Default::default(),
            job_agent_config: Default::default(),
            verification_metrics: Vec::new(),
            created_at: now,
        });

        let completed_at = now - Duration::minutes(completed_ago_minutes);
        store.insert_job(Job {
            id: "job-staging".into(),
            workspace_id: "ws-1".into(),
            release_id: Some(ReleaseId::new("rel-staging")),
            workflow_step_id: None,
            job_agent_id: None,
            job_agent_config: Default::default(),
            status: staging_job_status,
            dispatch_context: DispatchContext::default(),
            message: None,
            created_at: completed_at,
            updated_at: completed_at,
            completed_at: staging_job_status.is_terminal().then_some(completed_at),
        });
        store.drain_changes();
        store
    }

    fn depends_on_staging() -> Selector {
        Selector::tree(ConditionNode::name(ConditionOperator::StartsWith, "staging"))
    }

    #[test]
    fn test_soaked_success_allows() {
        let store = seed_store(JobStatus::Successful, 3);
        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());

        let depends_on = depends_on_staging();
        let verdict = evaluate(
            &ctx,
            &ReleaseTarget::new("dep-1", "env-prod", "res-1"),
            &DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", Utc::now()),
            &ProgressionParams {
                depends_on: &depends_on,
                min_soak_minutes: Some(2),
                min_success_percentage: None,
                max_age_hours: None,
            },
        );
        assert!(verdict.is_allowed());
    }

    #[test]
    fn test_unsoaked_success_is_pending_until_soak_elapses() {
        let store = seed_store(JobStatus::Successful, 1);
        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let now = Utc::now();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, now);

        let depends_on = depends_on_staging();
        let verdict = evaluate(
            &ctx,
            &ReleaseTarget::new("dep-1", "env-prod", "res-1"),
            &DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", now),
            &ProgressionParams {
                depends_on: &depends_on,
                min_soak_minutes: Some(5),
                min_success_percentage: None,
                max_age_hours: None,
            },
        );
        assert!(verdict.is_pending());
        assert!(verdict.until().unwrap() > now);
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let store = seed_store(JobStatus::Failure, 3);
        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());

        let depends_on = depends_on_staging();
        let verdict = evaluate(
            &ctx,
            &ReleaseTarget::new("dep-1", "env-prod", "res-1"),
            &DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", Utc::now()),
            &ProgressionParams {
                depends_on: &depends_on,
                min_soak_minutes: None,
                min_success_percentage: None,
                max_age_hours: None,
            },
        );
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_stale_success_blocks_on_max_age() {
        let store = seed_store(JobStatus::Successful, 60 * 30);
        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());

        let depends_on = depends_on_staging();
        let verdict = evaluate(
            &ctx,
            &ReleaseTarget::new("dep-1", "env-prod", "res-1"),
            &DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.0.0", Utc::now()),
            &ProgressionParams {
                depends_on: &depends_on,
                min_soak_minutes: None,
                min_success_percentage: None,
                max_age_hours: Some(24),
            },
        );
        assert!(verdict.is_blocked());
    }
}
