//! Relationship index
//!
//! Materializes the edges declared by relationship rules: for every
//! `(entity, reference_name)` the set of related entities, in both
//! directions. Rules are evaluated iteration-incrementally; the full
//! cartesian product is never held, and a targeted mark re-evaluates
//! only pairs involving the changed entity.

use keel_selector::{SelectorEngine, SelectorSubject};
use keel_store::WorkspaceStore;
use keel_types::{
    PropertyOperator, RelationshipEntityType, RelationshipMatcher, RelationshipRule,
    RelationshipRuleId,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// An entity addressable by relationship rules.
pub type EntityKey = (RelationshipEntityType, String);

/// Dirty state of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Dirty {
    Clean,
    All,
    Entities(BTreeSet<EntityKey>),
}

/// Per-rule edge sets plus the merged per-reference lookups.
#[derive(Debug, Default)]
pub struct RelationshipIndex {
    /// rule id -> from entity -> to entities
    forward: BTreeMap<RelationshipRuleId, BTreeMap<EntityKey, BTreeSet<EntityKey>>>,

    /// rule id -> to entity -> from entities
    reverse: BTreeMap<RelationshipRuleId, BTreeMap<EntityKey, BTreeSet<EntityKey>>>,

    /// rule id -> reference name, for merged lookups
    references: BTreeMap<RelationshipRuleId, String>,

    dirty: Dirty,
}

impl Default for Dirty {
    fn default() -> Self {
        Dirty::Clean
    }
}

impl RelationshipIndex {
    pub fn new() -> Self {
        Self {
            dirty: Dirty::All,
            ..Self::default()
        }
    }

    /// Invalidate everything; the next recompute rebuilds from scratch.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = Dirty::All;
    }

    /// Invalidate pairs involving one entity.
    pub fn mark_entity_dirty(&mut self, entity_type: RelationshipEntityType, id: impl Into<String>) {
        match &mut self.dirty {
            Dirty::All => {}
            Dirty::Entities(set) => {
                set.insert((entity_type, id.into()));
            }
            Dirty::Clean => {
                let mut set = BTreeSet::new();
                set.insert((entity_type, id.into()));
                self.dirty = Dirty::Entities(set);
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != Dirty::Clean
    }

    /// Entities related out of `from` via `reference_name`, across all
    /// rules carrying that reference.
    pub fn related_from(&self, from: &EntityKey, reference_name: &str) -> BTreeSet<EntityKey> {
        let mut related = BTreeSet::new();
        for (rule_id, reference) in &self.references {
            if reference != reference_name {
                continue;
            }
            if let Some(edges) = self.forward.get(rule_id).and_then(|m| m.get(from)) {
                related.extend(edges.iter().cloned());
            }
        }
        related
    }

    /// Entities relating into `to` via `reference_name`.
    pub fn related_to(&self, to: &EntityKey, reference_name: &str) -> BTreeSet<EntityKey> {
        let mut related = BTreeSet::new();
        for (rule_id, reference) in &self.references {
            if reference != reference_name {
                continue;
            }
            if let Some(edges) = self.reverse.get(rule_id).and_then(|m| m.get(to)) {
                related.extend(edges.iter().cloned());
            }
        }
        related
    }

    /// Total edge count, for observability.
    pub fn edge_count(&self) -> usize {
        self.forward
            .values()
            .flat_map(|m| m.values())
            .map(|s| s.len())
            .sum()
    }

    /// Drain the dirty set and re-evaluate affected pairs. Returns the
    /// number of pair evaluations performed.
    pub fn recompute(&mut self, store: &WorkspaceStore, selectors: &SelectorEngine) -> usize {
        let dirty = std::mem::replace(&mut self.dirty, Dirty::Clean);
        let rules: Vec<RelationshipRule> = store.relationship_rules().cloned().collect();

        // Drop edges of rules that no longer exist.
        let live: BTreeSet<&RelationshipRuleId> = rules.iter().map(|r| &r.id).collect();
        self.forward.retain(|rule_id, _| live.contains(rule_id));
        self.reverse.retain(|rule_id, _| live.contains(rule_id));
        self.references.retain(|rule_id, _| live.contains(rule_id));

        match dirty {
            Dirty::Clean => 0,
            Dirty::All => {
                self.forward.clear();
                self.reverse.clear();
                self.references.clear();
                let mut evaluations = 0;
                for rule in &rules {
                    self.references
                        .insert(rule.id.clone(), rule.reference_name.clone());
                    let froms = candidates(store, selectors, rule.from_type, rule.from_selector.as_ref());
                    let tos = candidates(store, selectors, rule.to_type, rule.to_selector.as_ref());
                    for (from_key, from_json) in &froms {
                        for (to_key, to_json) in &tos {
                            evaluations += 1;
                            if matches(selectors, &rule.matcher, from_json, to_json) {
                                self.add_edge(&rule.id, from_key.clone(), to_key.clone());
                            }
                        }
                    }
                }
                evaluations
            }
            Dirty::Entities(entities) => {
                let mut evaluations = 0;
                for rule in &rules {
                    self.references
                        .insert(rule.id.clone(), rule.reference_name.clone());
                    for entity in &entities {
                        evaluations += self.recompute_entity(store, selectors, rule, entity);
                    }
                }
                // Deleted entities keep no edges regardless of rule side.
                for entity in &entities {
                    if !entity_exists(store, entity) {
                        self.remove_entity(entity);
                    }
                }
                evaluations
            }
        }
    }

    fn recompute_entity(
        &mut self,
        store: &WorkspaceStore,
        selectors: &SelectorEngine,
        rule: &RelationshipRule,
        entity: &EntityKey,
    ) -> usize {
        let mut evaluations = 0;

        if entity.0 == rule.from_type {
            // Drop this entity's outgoing edges for the rule, then
            // re-evaluate it against the full `to` side.
            if let Some(edges) = self.forward.get_mut(&rule.id) {
                if let Some(tos) = edges.remove(entity) {
                    let reverse = self.reverse.entry(rule.id.clone()).or_default();
                    for to in tos {
                        if let Some(froms) = reverse.get_mut(&to) {
                            froms.remove(entity);
                        }
                    }
                }
            }
            if let Some(from_json) = admitted_json(store, selectors, entity, rule.from_selector.as_ref())
            {
                let tos = candidates(store, selectors, rule.to_type, rule.to_selector.as_ref());
                for (to_key, to_json) in &tos {
                    evaluations += 1;
                    if matches(selectors, &rule.matcher, &from_json, to_json) {
                        self.add_edge(&rule.id, entity.clone(), to_key.clone());
                    }
                }
            }
        }

        if entity.0 == rule.to_type {
            if let Some(edges) = self.reverse.get_mut(&rule.id) {
                if let Some(froms) = edges.remove(entity) {
                    let forward = self.forward.entry(rule.id.clone()).or_default();
                    for from in froms {
                        if let Some(tos) = forward.get_mut(&from) {
                            tos.remove(entity);
                        }
                    }
                }
            }
            if let Some(to_json) = admitted_json(store, selectors, entity, rule.to_selector.as_ref())
            {
                let froms = candidates(store, selectors, rule.from_type, rule.from_selector.as_ref());
                for (from_key, from_json) in &froms {
                    evaluations += 1;
                    if matches(selectors, &rule.matcher, from_json, &to_json) {
                        self.add_edge(&rule.id, from_key.clone(), entity.clone());
                    }
                }
            }
        }

        evaluations
    }

    fn add_edge(&mut self, rule_id: &RelationshipRuleId, from: EntityKey, to: EntityKey) {
        self.forward
            .entry(rule_id.clone())
            .or_default()
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.reverse
            .entry(rule_id.clone())
            .or_default()
            .entry(to)
            .or_default()
            .insert(from);
    }

    fn remove_entity(&mut self, entity: &EntityKey) {
        for edges in self.forward.values_mut() {
            edges.remove(entity);
            for tos in edges.values_mut() {
                tos.remove(entity);
            }
        }
        for edges in self.reverse.values_mut() {
            edges.remove(entity);
            for froms in edges.values_mut() {
                froms.remove(entity);
            }
        }
    }
}

/// Candidates of one rule side: entities of the type the selector
/// admits, with their JSON for matcher evaluation.
fn candidates(
    store: &WorkspaceStore,
    selectors: &SelectorEngine,
    entity_type: RelationshipEntityType,
    selector: Option<&keel_types::Selector>,
) -> Vec<(EntityKey, Value)> {
    subjects_of(store, entity_type)
        .into_iter()
        .filter(|(_, subject)| selectors.admits_opt(selector, subject))
        .map(|(key, subject)| (key, subject.json))
        .collect()
}

fn subjects_of(
    store: &WorkspaceStore,
    entity_type: RelationshipEntityType,
) -> Vec<(EntityKey, SelectorSubject)> {
    match entity_type {
        RelationshipEntityType::Resource => store
            .resources()
            .map(|r| {
                (
                    (entity_type, r.id.to_string()),
                    SelectorSubject::resource(r),
                )
            })
            .collect(),
        RelationshipEntityType::Deployment => store
            .deployments()
            .map(|d| {
                (
                    (entity_type, d.id.to_string()),
                    SelectorSubject::deployment(d),
                )
            })
            .collect(),
        RelationshipEntityType::Environment => store
            .environments()
            .map(|e| {
                (
                    (entity_type, e.id.to_string()),
                    SelectorSubject::environment(e),
                )
            })
            .collect(),
    }
}

fn admitted_json(
    store: &WorkspaceStore,
    selectors: &SelectorEngine,
    entity: &EntityKey,
    selector: Option<&keel_types::Selector>,
) -> Option<Value> {
    let subject = subject_of(store, entity)?;
    if selectors.admits_opt(selector, &subject) {
        Some(subject.json)
    } else {
        None
    }
}

fn subject_of(store: &WorkspaceStore, entity: &EntityKey) -> Option<SelectorSubject> {
    match entity.0 {
        RelationshipEntityType::Resource => store
            .resource(&entity.1.as_str().into())
            .map(SelectorSubject::resource),
        RelationshipEntityType::Deployment => store
            .deployment(&entity.1.as_str().into())
            .map(SelectorSubject::deployment),
        RelationshipEntityType::Environment => store
            .environment(&entity.1.as_str().into())
            .map(SelectorSubject::environment),
    }
}

fn entity_exists(store: &WorkspaceStore, entity: &EntityKey) -> bool {
    subject_of(store, entity).is_some()
}

/// Resolve an entity's JSON for path traversal (variable references).
pub fn entity_json(store: &WorkspaceStore, entity: &EntityKey) -> Option<Value> {
    subject_of(store, entity).map(|s| s.json)
}

fn matches(
    selectors: &SelectorEngine,
    matcher: &RelationshipMatcher,
    from: &Value,
    to: &Value,
) -> bool {
    match matcher {
        RelationshipMatcher::Property {
            from_path,
            to_path,
            operator,
        } => {
            let lhs = traverse(from, from_path);
            let rhs = traverse(to, to_path);
            match operator {
                PropertyOperator::Equals => {
                    !lhs.is_null() && lhs == rhs
                }
            }
        }
        RelationshipMatcher::Cel { expression } => {
            selectors.evaluate_pair(expression, from, to).unwrap_or_else(|error| {
                warn!(%error, "relationship matcher evaluation failed; treating as non-match");
                false
            })
        }
    }
}

/// Walk a JSON path, yielding null when any hop is missing.
pub fn traverse(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{Resource, Selector};

    fn vpc_rule() -> RelationshipRule {
        RelationshipRule {
            id: RelationshipRuleId::new("rule-vpc"),
            workspace_id: "ws-1".into(),
            from_type: RelationshipEntityType::Resource,
            to_type: RelationshipEntityType::Resource,
            reference_name: "vpc".to_string(),
            from_selector: Some(Selector::tree(keel_types::ConditionNode::kind_equals(
                "Kubernetes",
            ))),
            to_selector: Some(Selector::tree(keel_types::ConditionNode::kind_equals("Vpc"))),
            matcher: RelationshipMatcher::Property {
                from_path: vec!["metadata".into(), "vpc".into()],
                to_path: vec!["identifier".into()],
                operator: PropertyOperator::Equals,
            },
        }
    }

    fn store_with_rule() -> WorkspaceStore {
        let mut store = WorkspaceStore::new("ws-1");
        store.upsert_relationship_rule(vpc_rule());
        store.upsert_resource(
            Resource::new("res-k8s", "ws-1", "cluster", "Kubernetes", "k8s/1")
                .with_metadata("vpc", "vpc-123"),
        );
        store.upsert_resource(Resource::new("res-vpc", "ws-1", "vpc", "Vpc", "vpc-123"));
        store.drain_changes();
        store
    }

    #[test]
    fn test_full_rebuild_links_matching_pairs() {
        let store = store_with_rule();
        let selectors = SelectorEngine::with_basic_evaluator();
        let mut index = RelationshipIndex::new();

        let evaluations = index.recompute(&store, &selectors);
        assert_eq!(evaluations, 1); // 1 from-candidate x 1 to-candidate

        let from = (RelationshipEntityType::Resource, "res-k8s".to_string());
        let related = index.related_from(&from, "vpc");
        assert_eq!(related.len(), 1);
        assert!(related.contains(&(RelationshipEntityType::Resource, "res-vpc".to_string())));
    }

    #[test]
    fn test_targeted_mark_adds_new_entity() {
        let mut store = store_with_rule();
        let selectors = SelectorEngine::with_basic_evaluator();
        let mut index = RelationshipIndex::new();
        index.recompute(&store, &selectors);

        store.upsert_resource(
            Resource::new("res-k8s-2", "ws-1", "cluster-2", "Kubernetes", "k8s/2")
                .with_metadata("vpc", "vpc-123"),
        );
        store.drain_changes();
        index.mark_entity_dirty(RelationshipEntityType::Resource, "res-k8s-2");
        index.recompute(&store, &selectors);

        let from = (RelationshipEntityType::Resource, "res-k8s-2".to_string());
        assert_eq!(index.related_from(&from, "vpc").len(), 1);
        // Existing edges survive targeted recompute
        let from = (RelationshipEntityType::Resource, "res-k8s".to_string());
        assert_eq!(index.related_from(&from, "vpc").len(), 1);
    }

    #[test]
    fn test_deleted_entity_loses_edges() {
        let mut store = store_with_rule();
        let selectors = SelectorEngine::with_basic_evaluator();
        let mut index = RelationshipIndex::new();
        index.recompute(&store, &selectors);

        store.delete_resource(&"res-vpc".into());
        store.drain_changes();
        index.mark_entity_dirty(RelationshipEntityType::Resource, "res-vpc");
        index.recompute(&store, &selectors);

        let from = (RelationshipEntityType::Resource, "res-k8s".to_string());
        assert!(index.related_from(&from, "vpc").is_empty());
        assert_eq!(index.edge_count(), 0);
    }

    #[test]
    fn test_clean_recompute_is_zero_work() {
        let store = store_with_rule();
        let selectors = SelectorEngine::with_basic_evaluator();
        let mut index = RelationshipIndex::new();
        index.recompute(&store, &selectors);

        assert_eq!(index.recompute(&store, &selectors), 0);
    }

    #[test]
    fn test_traverse_missing_path_is_null() {
        let value = serde_json::json!({"metadata": {"cidr": "10.0.0.0/16"}});
        assert_eq!(
            traverse(&value, &["metadata".into(), "cidr".into()]),
            serde_json::json!("10.0.0.0/16")
        );
        assert_eq!(traverse(&value, &["metadata".into(), "nope".into()]), Value::Null);
    }
}
