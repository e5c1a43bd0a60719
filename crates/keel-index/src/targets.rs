//! Release-target materializer
//!
//! A release target exists for every (deployment, environment, resource)
//! triple where the deployment and environment share a system and both
//! resource selectors admit the resource. Any change to a selector,
//! resource, system link, deployment, or environment produces a targeted
//! dirty set; only the affected slices are rebuilt.

use keel_selector::{SelectorEngine, SelectorSubject};
use keel_store::WorkspaceStore;
use keel_types::{Deployment, DeploymentId, Environment, EnvironmentId, ReleaseTarget, ResourceId};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of one materialization pass.
#[derive(Debug, Default)]
pub struct TargetRecompute {
    /// Targets that newly exist
    pub added: Vec<ReleaseTarget>,

    /// Targets that no longer exist; their in-flight jobs are cancelled
    /// by the release manager on the next reconcile
    pub removed: Vec<ReleaseTarget>,

    /// Selector evaluations performed
    pub evaluations: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DirtySlices {
    all: bool,
    deployments: BTreeSet<DeploymentId>,
    environments: BTreeSet<EnvironmentId>,
    resources: BTreeSet<ResourceId>,
}

impl DirtySlices {
    fn is_clean(&self) -> bool {
        !self.all
            && self.deployments.is_empty()
            && self.environments.is_empty()
            && self.resources.is_empty()
    }
}

/// Materialized release targets with per-dimension views.
#[derive(Debug, Default)]
pub struct ReleaseTargetIndex {
    targets: BTreeMap<String, ReleaseTarget>,
    by_deployment: BTreeMap<DeploymentId, BTreeSet<String>>,
    by_environment: BTreeMap<EnvironmentId, BTreeSet<String>>,
    by_resource: BTreeMap<ResourceId, BTreeSet<String>>,
    dirty: DirtySlices,
}

impl ReleaseTargetIndex {
    pub fn new() -> Self {
        Self {
            dirty: DirtySlices {
                all: true,
                ..DirtySlices::default()
            },
            ..Self::default()
        }
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty.all = true;
    }

    pub fn mark_deployment_dirty(&mut self, id: DeploymentId) {
        self.dirty.deployments.insert(id);
    }

    pub fn mark_environment_dirty(&mut self, id: EnvironmentId) {
        self.dirty.environments.insert(id);
    }

    pub fn mark_resource_dirty(&mut self, id: ResourceId) {
        self.dirty.resources.insert(id);
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_clean()
    }

    /// All current targets in stable key order.
    pub fn items(&self) -> impl Iterator<Item = &ReleaseTarget> {
        self.targets.values()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.targets.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ReleaseTarget> {
        self.targets.get(key)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn for_deployment(&self, id: &DeploymentId) -> Vec<&ReleaseTarget> {
        self.view(&self.by_deployment, id)
    }

    pub fn for_environment(&self, id: &EnvironmentId) -> Vec<&ReleaseTarget> {
        self.view(&self.by_environment, id)
    }

    pub fn for_resource(&self, id: &ResourceId) -> Vec<&ReleaseTarget> {
        self.view(&self.by_resource, id)
    }

    fn view<'a, K: Ord>(
        &'a self,
        map: &'a BTreeMap<K, BTreeSet<String>>,
        id: &K,
    ) -> Vec<&'a ReleaseTarget> {
        map.get(id)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|key| self.targets.get(key))
            .collect()
    }

    /// Drain the dirty slices and rematerialize just those.
    pub fn recompute(
        &mut self,
        store: &WorkspaceStore,
        selectors: &SelectorEngine,
    ) -> TargetRecompute {
        let dirty = std::mem::take(&mut self.dirty);
        if dirty.is_clean() {
            return TargetRecompute::default();
        }

        let mut outcome = TargetRecompute::default();

        if dirty.all {
            let mut desired = BTreeMap::new();
            for deployment in store.deployments() {
                outcome.evaluations +=
                    materialize_deployment(store, selectors, deployment, &mut desired);
            }
            self.replace_all(desired, &mut outcome);
            return outcome;
        }

        // Per-dimension slices; overlapping marks converge because each
        // slice replacement is computed from scratch.
        for deployment_id in &dirty.deployments {
            let mut desired = BTreeMap::new();
            if let Some(deployment) = store.deployment(deployment_id) {
                outcome.evaluations +=
                    materialize_deployment(store, selectors, deployment, &mut desired);
            }
            self.replace_deployment_slice(deployment_id, desired, &mut outcome);
        }

        for environment_id in &dirty.environments {
            let mut desired = BTreeMap::new();
            if let Some(environment) = store.environment(environment_id) {
                outcome.evaluations +=
                    materialize_environment(store, selectors, environment, &mut desired);
            }
            self.replace_environment_slice(environment_id, desired, &mut outcome);
        }

        for resource_id in &dirty.resources {
            let mut desired = BTreeMap::new();
            if let Some(resource) = store.resource(resource_id) {
                let subject = SelectorSubject::resource(resource);
                for deployment in store.deployments() {
                    for environment in store.environments() {
                        if !shares_system(store, deployment, environment) {
                            continue;
                        }
                        outcome.evaluations += 2;
                        if selectors.admits_opt(deployment.resource_selector.as_ref(), &subject)
                            && selectors
                                .admits_opt(environment.resource_selector.as_ref(), &subject)
                        {
                            let target = ReleaseTarget::new(
                                deployment.id.clone(),
                                environment.id.clone(),
                                resource.id.clone(),
                            );
                            desired.insert(target.key(), target);
                        }
                    }
                }
            }
            self.replace_resource_slice(resource_id, desired, &mut outcome);
        }

        outcome
    }

    fn replace_all(
        &mut self,
        desired: BTreeMap<String, ReleaseTarget>,
        outcome: &mut TargetRecompute,
    ) {
        for (key, target) in &self.targets {
            if !desired.contains_key(key) {
                outcome.removed.push(target.clone());
            }
        }
        for (key, target) in &desired {
            if !self.targets.contains_key(key) {
                outcome.added.push(target.clone());
            }
        }
        self.targets = desired;
        self.rebuild_views();
    }

    fn replace_deployment_slice(
        &mut self,
        id: &DeploymentId,
        desired: BTreeMap<String, ReleaseTarget>,
        outcome: &mut TargetRecompute,
    ) {
        let existing: Vec<String> = self
            .by_deployment
            .get(id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        self.replace_slice(existing, desired, outcome);
    }

    fn replace_environment_slice(
        &mut self,
        id: &EnvironmentId,
        desired: BTreeMap<String, ReleaseTarget>,
        outcome: &mut TargetRecompute,
    ) {
        let existing: Vec<String> = self
            .by_environment
            .get(id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        self.replace_slice(existing, desired, outcome);
    }

    fn replace_resource_slice(
        &mut self,
        id: &ResourceId,
        desired: BTreeMap<String, ReleaseTarget>,
        outcome: &mut TargetRecompute,
    ) {
        let existing: Vec<String> = self
            .by_resource
            .get(id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        self.replace_slice(existing, desired, outcome);
    }

    fn replace_slice(
        &mut self,
        existing: Vec<String>,
        desired: BTreeMap<String, ReleaseTarget>,
        outcome: &mut TargetRecompute,
    ) {
        for key in existing {
            if !desired.contains_key(&key) {
                if let Some(removed) = self.remove_target(&key) {
                    outcome.removed.push(removed);
                }
            }
        }
        for (key, target) in desired {
            if !self.targets.contains_key(&key) {
                self.insert_target(target.clone());
                outcome.added.push(target);
            }
        }
    }

    fn insert_target(&mut self, target: ReleaseTarget) {
        let key = target.key();
        self.by_deployment
            .entry(target.deployment_id.clone())
            .or_default()
            .insert(key.clone());
        self.by_environment
            .entry(target.environment_id.clone())
            .or_default()
            .insert(key.clone());
        self.by_resource
            .entry(target.resource_id.clone())
            .or_default()
            .insert(key.clone());
        self.targets.insert(key, target);
    }

    fn remove_target(&mut self, key: &str) -> Option<ReleaseTarget> {
        let target = self.targets.remove(key)?;
        if let Some(keys) = self.by_deployment.get_mut(&target.deployment_id) {
            keys.remove(key);
        }
        if let Some(keys) = self.by_environment.get_mut(&target.environment_id) {
            keys.remove(key);
        }
        if let Some(keys) = self.by_resource.get_mut(&target.resource_id) {
            keys.remove(key);
        }
        Some(target)
    }

    fn rebuild_views(&mut self) {
        self.by_deployment.clear();
        self.by_environment.clear();
        self.by_resource.clear();
        let targets: Vec<ReleaseTarget> = self.targets.values().cloned().collect();
        for target in targets {
            let key = target.key();
            self.by_deployment
                .entry(target.deployment_id.clone())
                .or_default()
                .insert(key.clone());
            self.by_environment
                .entry(target.environment_id.clone())
                .or_default()
                .insert(key.clone());
            self.by_resource
                .entry(target.resource_id)
                .or_default()
                .insert(key);
        }
    }
}

/// Deployment and environment must share at least one live system.
fn shares_system(store: &WorkspaceStore, deployment: &Deployment, environment: &Environment) -> bool {
    deployment.system_ids().any(|system_id| {
        store.system(system_id).is_some() && environment.system_ids().any(|e| e == system_id)
    })
}

fn materialize_deployment(
    store: &WorkspaceStore,
    selectors: &SelectorEngine,
    deployment: &Deployment,
    desired: &mut BTreeMap<String, ReleaseTarget>,
) -> usize {
    let mut evaluations = 0;
    for environment in store.environments() {
        if !shares_system(store, deployment, environment) {
            continue;
        }
        for resource in store.resources() {
            let subject = SelectorSubject::resource(resource);
            evaluations += 2;
            if selectors.admits_opt(deployment.resource_selector.as_ref(), &subject)
                && selectors.admits_opt(environment.resource_selector.as_ref(), &subject)
            {
                let target = ReleaseTarget::new(
                    deployment.id.clone(),
                    environment.id.clone(),
                    resource.id.clone(),
                );
                desired.insert(target.key(), target);
            }
        }
    }
    evaluations
}

fn materialize_environment(
    store: &WorkspaceStore,
    selectors: &SelectorEngine,
    environment: &Environment,
    desired: &mut BTreeMap<String, ReleaseTarget>,
) -> usize {
    let mut evaluations = 0;
    for deployment in store.deployments() {
        if !shares_system(store, deployment, environment) {
            continue;
        }
        for resource in store.resources() {
            let subject = SelectorSubject::resource(resource);
            evaluations += 2;
            if selectors.admits_opt(deployment.resource_selector.as_ref(), &subject)
                && selectors.admits_opt(environment.resource_selector.as_ref(), &subject)
            {
                let target = ReleaseTarget::new(
                    deployment.id.clone(),
                    environment.id.clone(),
                    resource.id.clone(),
                );
                desired.insert(target.key(), target);
            }
        }
    }
    evaluations
}
