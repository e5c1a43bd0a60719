//! Policy evaluator
//!
//! For each policy whose selector admits the (deployment, environment,
//! resource) triple, evaluates every rule against the candidate version
//! and aggregates the verdicts. A matching, unexpired policy skip
//! converts a non-allow verdict to allow; the check records the waiver.

use crate::context::PolicyEvalContext;
use crate::rules;
use crate::rules::progression::ProgressionParams;
use crate::verdict::{RuleCheck, RuleVerdict, TargetDecision};
use keel_selector::SelectorSubject;
use keel_types::{DeploymentVersion, Policy, PolicyRuleKind, ReleaseTarget};
use tracing::debug;

/// Stateless policy evaluation service. Reconciliation calls
/// [`PolicyEvaluator::evaluate`] per candidate version.
#[derive(Debug, Default)]
pub struct PolicyEvaluator;

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate every applicable policy rule for the pair.
    pub fn evaluate(
        &self,
        ctx: &PolicyEvalContext<'_>,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
    ) -> TargetDecision {
        let mut decision = TargetDecision::default();

        for policy in ctx.store.policies() {
            if !self.applies(ctx, policy, target) {
                continue;
            }
            for rule in &policy.rules {
                let verdict = self.evaluate_rule(ctx, target, version, &rule.kind);

                let mut waived = false;
                let verdict = if !verdict.is_allowed() && self.is_waived(ctx, target, version, rule)
                {
                    waived = true;
                    RuleVerdict::allow()
                } else {
                    verdict
                };

                debug!(
                    policy_id = %policy.id,
                    rule_id = %rule.id,
                    waived,
                    allowed = verdict.is_allowed(),
                    "policy rule evaluated"
                );
                decision.checks.push(RuleCheck {
                    policy_id: policy.id.clone(),
                    rule_id: rule.id.clone(),
                    rule_kind: rule_kind_label(&rule.kind),
                    verdict,
                    waived,
                });
            }
        }

        decision
    }

    /// A policy applies when every member of its target selector admits
    /// the corresponding entity. Dangling entities never match.
    fn applies(&self, ctx: &PolicyEvalContext<'_>, policy: &Policy, target: &ReleaseTarget) -> bool {
        if let Some(selector) = &policy.selector.deployment {
            let Some(deployment) = ctx.store.deployment(&target.deployment_id) else {
                return false;
            };
            if !ctx
                .selectors
                .admits(selector, &SelectorSubject::deployment(deployment))
            {
                return false;
            }
        }
        if let Some(selector) = &policy.selector.environment {
            let Some(environment) = ctx.store.environment(&target.environment_id) else {
                return false;
            };
            if !ctx
                .selectors
                .admits(selector, &SelectorSubject::environment(environment))
            {
                return false;
            }
        }
        if let Some(selector) = &policy.selector.resource {
            let Some(resource) = ctx.store.resource(&target.resource_id) else {
                return false;
            };
            if !ctx
                .selectors
                .admits(selector, &SelectorSubject::resource(resource))
            {
                return false;
            }
        }
        true
    }

    fn evaluate_rule(
        &self,
        ctx: &PolicyEvalContext<'_>,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
        kind: &PolicyRuleKind,
    ) -> RuleVerdict {
        match kind {
            PolicyRuleKind::AnyApproval { min_approvals } => {
                rules::approval::evaluate(ctx, target, version, *min_approvals)
            }
            PolicyRuleKind::VersionSelector { selector } => {
                rules::version_selector::evaluate(ctx, version, selector)
            }
            PolicyRuleKind::EnvironmentProgression {
                depends_on,
                min_soak_minutes,
                min_success_percentage,
                max_age_hours,
            } => rules::progression::evaluate(
                ctx,
                target,
                version,
                &ProgressionParams {
                    depends_on,
                    min_soak_minutes: *min_soak_minutes,
                    min_success_percentage: *min_success_percentage,
                    max_age_hours: *max_age_hours,
                },
            ),
            PolicyRuleKind::GradualRollout {
                time_scale_interval_seconds,
            } => rules::rollout::evaluate(ctx, target, version, *time_scale_interval_seconds),
        }
    }

    fn is_waived(
        &self,
        ctx: &PolicyEvalContext<'_>,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
        rule: &keel_types::PolicyRule,
    ) -> bool {
        ctx.store.skips_for_version(&version.id).any(|skip| {
            skip.waives(
                &version.id,
                &target.environment_id,
                &target.resource_id,
                &rule.id,
                ctx.now,
            )
        })
    }
}

fn rule_kind_label(kind: &PolicyRuleKind) -> &'static str {
    match kind {
        PolicyRuleKind::AnyApproval { .. } => "any_approval",
        PolicyRuleKind::VersionSelector { .. } => "version_selector",
        PolicyRuleKind::EnvironmentProgression { .. } => "environment_progression",
        PolicyRuleKind::GradualRollout { .. } => "gradual_rollout",
    }
}
