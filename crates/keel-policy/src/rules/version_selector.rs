//! Version-selector rule

use crate::context::PolicyEvalContext;
use crate::verdict::RuleVerdict;
use keel_selector::SelectorSubject;
use keel_types::{DeploymentVersion, Selector};

pub fn evaluate(
    ctx: &PolicyEvalContext<'_>,
    version: &DeploymentVersion,
    selector: &Selector,
) -> RuleVerdict {
    let subject = SelectorSubject::version(version);
    if ctx.selectors.admits(selector, &subject) {
        RuleVerdict::allow()
    } else {
        RuleVerdict::block(format!(
            "version {} not admitted by version selector",
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
    use keel_types::{ConditionNode, ConditionOperator};

    #[test]
    fn test_tag_prefix_selector() {
        let store = WorkspaceStore::new("ws-1");
        let targets = ReleaseTargetIndex::new();
        let selectors = SelectorEngine::with_basic_evaluator();
        let ctx = PolicyEvalContext::new(&store, &targets, &selectors, Utc::now());

        let selector = Selector::tree(ConditionNode::name(ConditionOperator::StartsWith, "1."));
        let version = DeploymentVersion::new("v-1", "ws-1", "dep-1", "1.4.2", Utc::now());
        assert!(evaluate(&ctx, &version, &selector).is_allowed());

        let version = DeploymentVersion::new("v-2", "ws-1", "dep-1", "2.0.0", Utc::now());
        assert!(evaluate(&ctx, &version, &selector).is_blocked());
    }
}
