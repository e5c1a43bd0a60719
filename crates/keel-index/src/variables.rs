//! Variable resolver
//!
//! Resolves the frozen variable snapshot for a release target. For each
//! variable key declared on the deployment, precedence from highest to
//! lowest:
//!
//! 1. a resource variable pinned on the target's resource,
//! 2. the highest-priority deployment variable value whose resource
//!    selector admits the resource,
//! 3. the deployment variable's default.
//!
//! References resolve through the relationship graph; an unresolvable
//! reference yields null and a warning rather than an error.

use crate::relationships::{entity_json, traverse, RelationshipIndex};
use keel_selector::{SelectorEngine, SelectorSubject};
use keel_store::WorkspaceStore;
use keel_types::{
    DeploymentVariableValue, ReleaseTarget, RelationshipEntityType, VariableValue,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Resolved variables plus any reference warnings for the trace.
#[derive(Debug, Default)]
pub struct ResolvedVariables {
    pub values: BTreeMap<String, Value>,
    pub warnings: Vec<String>,
}

/// Resolve every variable declared on the target's deployment.
pub fn resolve_variables(
    store: &WorkspaceStore,
    relationships: &RelationshipIndex,
    selectors: &SelectorEngine,
    target: &ReleaseTarget,
) -> ResolvedVariables {
    let mut resolved = ResolvedVariables::default();

    let Some(resource) = store.resource(&target.resource_id) else {
        resolved
            .warnings
            .push(format!("resource {} not found", target.resource_id));
        return resolved;
    };
    let subject = SelectorSubject::resource(resource);

    for variable in store.variables_for_deployment(&target.deployment_id) {
        // 1. Resource-pinned variable wins outright.
        if let Some(pinned) = store.resource_variable(&target.resource_id, &variable.key) {
            let value = resolve_value(store, relationships, target, &pinned.value, &mut resolved);
            resolved.values.insert(variable.key.clone(), value);
            continue;
        }

        // 2. Highest-priority admitting deployment value.
        let mut candidates: Vec<&DeploymentVariableValue> =
            store.values_for_variable(&variable.id).collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        let winner = candidates
            .into_iter()
            .find(|v| selectors.admits_opt(v.resource_selector.as_ref(), &subject));
        if let Some(winner) = winner {
            let value = resolve_value(store, relationships, target, &winner.value, &mut resolved);
            resolved.values.insert(variable.key.clone(), value);
            continue;
        }

        // 3. Declared default, when present.
        if let Some(default) = &variable.default_value {
            resolved
                .values
                .insert(variable.key.clone(), default.clone());
        }
    }

    resolved
}

fn resolve_value(
    store: &WorkspaceStore,
    relationships: &RelationshipIndex,
    target: &ReleaseTarget,
    value: &VariableValue,
    resolved: &mut ResolvedVariables,
) -> Value {
    match value {
        VariableValue::Literal { value } => value.clone(),
        VariableValue::Reference {
            reference_name,
            path,
        } => {
            let from = (
                RelationshipEntityType::Resource,
                target.resource_id.to_string(),
            );
            let related = relationships.related_from(&from, reference_name);
            let Some(first) = related.iter().next() else {
                let warning = format!(
                    "reference `{reference_name}` from resource {} resolves to no entity",
                    target.resource_id
                );
                debug!("{warning}");
                resolved.warnings.push(warning);
                return Value::Null;
            };
            let Some(json) = entity_json(store, first) else {
                let warning = format!(
                    "reference `{reference_name}` points at missing {} {}",
                    first.0, first.1
                );
                debug!("{warning}");
                resolved.warnings.push(warning);
                return Value::Null;
            };
            let result = traverse(&json, path);
            if result.is_null() {
                resolved.warnings.push(format!(
                    "reference `{reference_name}` path {:?} is empty on {} {}",
                    path, first.0, first.1
                ));
            }
            result
        }
    }
}
