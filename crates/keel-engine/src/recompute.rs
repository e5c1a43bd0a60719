//! Dirty-set translation and the recompute loop
//!
//! Every store mutation is a change record; this module owns the
//! dependency table translating records into dirty marks on the derived
//! indexes, and the loop that drains those marks in dependency order:
//! relationships, release targets, then the release manager for every
//! dirtied target. The loop is convergent: job and release writes made
//! by reconciliation translate to no further marks, so a recompute on a
//! clean workspace performs zero evaluations.

use crate::trace::{TraceBuilder, TraceSink};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use keel_release::{ReconcileDeps, ReconcileNote, ReleaseManager};
use keel_selector::SelectorEngine;
use keel_store::{ChangeRecord, EntityType};
use keel_types::{DeploymentId, EnvironmentId, JobId, RelationshipEntityType, ResourceId};
use std::collections::BTreeSet;
use tracing::warn;

/// Release targets whose desired release must be re-derived. Dimension
/// marks expand into concrete keys once the target index is current.
#[derive(Debug, Default)]
pub struct DirtyTargets {
    all: bool,
    deployments: BTreeSet<DeploymentId>,
    environments: BTreeSet<EnvironmentId>,
    resources: BTreeSet<ResourceId>,
    keys: BTreeSet<String>,
}

impl DirtyTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything gets reconciled on the next pass.
    pub fn mark_all(&mut self) {
        self.all = true;
    }

    /// One target, by key.
    pub fn mark_key(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn mark_deployment(&mut self, id: DeploymentId) {
        self.deployments.insert(id);
    }

    pub fn mark_environment(&mut self, id: EnvironmentId) {
        self.environments.insert(id);
    }

    pub fn mark_resource(&mut self, id: ResourceId) {
        self.resources.insert(id);
    }

    pub fn is_clean(&self) -> bool {
        !self.all
            && self.deployments.is_empty()
            && self.environments.is_empty()
            && self.resources.is_empty()
            && self.keys.is_empty()
    }

    /// Expand every mark into concrete target keys against the current
    /// index, leaving the set clean.
    fn drain_keys(&mut self, targets: &keel_index::ReleaseTargetIndex) -> BTreeSet<String> {
        let mut keys = std::mem::take(&mut self.keys);
        if std::mem::take(&mut self.all) {
            keys.extend(targets.items().map(|t| t.key()));
            self.deployments.clear();
            self.environments.clear();
            self.resources.clear();
            return keys;
        }
        for id in std::mem::take(&mut self.deployments) {
            keys.extend(targets.for_deployment(&id).into_iter().map(|t| t.key()));
        }
        for id in std::mem::take(&mut self.environments) {
            keys.extend(targets.for_environment(&id).into_iter().map(|t| t.key()));
        }
        for id in std::mem::take(&mut self.resources) {
            keys.extend(targets.for_resource(&id).into_iter().map(|t| t.key()));
        }
        keys
    }
}

/// Counters and side effects from one recompute, for observability.
#[derive(Debug, Default)]
pub struct RecomputeStats {
    /// Relationship pair evaluations
    pub relationship_evaluations: usize,

    /// Selector evaluations spent materializing targets
    pub selector_evaluations: usize,

    /// Targets that newly exist
    pub targets_added: usize,

    /// Targets that stopped existing
    pub targets_removed: usize,

    /// Targets reconciled
    pub reconciled_targets: usize,

    /// Loop rounds until convergence
    pub rounds: usize,

    /// Jobs created across all reconciles
    pub created_jobs: Vec<JobId>,

    /// Jobs cancelled across all reconciles
    pub cancelled_jobs: Vec<JobId>,

    /// Pending-rule wake-ups: (target key, earliest eligible instant)
    pub wakeups: Vec<(String, DateTime<Utc>)>,
}

// Reconciliation writes jobs and releases, which translate to no
// marks; one extra round drains them. The cap only guards against a
// translation bug re-marking its own output.
const MAX_ROUNDS: usize = 8;

/// Drain dirty state to convergence: translate pending change records,
/// rebuild dirty index slices, reconcile every dirtied target.
pub fn run_recompute(
    workspace: &mut Workspace,
    selectors: &SelectorEngine,
    release: &ReleaseManager,
    trace_sink: &dyn TraceSink,
    seed: DirtyTargets,
    trigger: &str,
    now: DateTime<Utc>,
) -> RecomputeStats {
    let mut stats = RecomputeStats::default();
    let mut dirty = seed;

    loop {
        let records = workspace.store.drain_changes();
        mark_from_changes(workspace, &records, &mut dirty);

        let indexes_dirty =
            workspace.relationships.is_dirty() || workspace.targets.is_dirty();
        stats.relationship_evaluations += workspace
            .relationships
            .recompute(&workspace.store, selectors);
        let materialized = workspace.targets.recompute(&workspace.store, selectors);
        stats.selector_evaluations += materialized.evaluations;
        stats.targets_added += materialized.added.len();
        stats.targets_removed += materialized.removed.len();

        for target in &materialized.removed {
            let cancelled =
                release.reconcile_removed_target(&mut workspace.store, &target.key(), now);
            stats.cancelled_jobs.extend(cancelled);
        }
        for target in &materialized.added {
            dirty.mark_key(target.key());
        }

        let keys = dirty.drain_keys(&workspace.targets);
        if records.is_empty() && !indexes_dirty && keys.is_empty() {
            break;
        }
        stats.rounds += 1;

        for key in keys {
            let Some(target) = workspace.targets.get(&key).cloned() else {
                continue;
            };
            let deps = ReconcileDeps {
                targets: &workspace.targets,
                relationships: &workspace.relationships,
                selectors,
            };
            let outcome = release.reconcile_target(&mut workspace.store, &deps, &target, now);
            stats.reconciled_targets += 1;

            let mut trace = TraceBuilder::new(
                workspace.workspace_id().clone(),
                key.clone(),
                trigger,
                now,
            );
            let planning = trace.phase("Planning");
            let eligibility = trace.phase("Eligibility");
            let execution = trace.phase("Execution");
            for check in &outcome.checks {
                trace.check(eligibility, check);
            }
            for note in &outcome.notes {
                match note {
                    ReconcileNote::Decision(message) => {
                        trace.decision(planning, message.clone());
                    }
                    ReconcileNote::Action(message) => {
                        trace.action(execution, message.clone());
                    }
                }
            }
            trace_sink.export(trace.finish());

            stats.created_jobs.extend(outcome.created_job);
            stats.cancelled_jobs.extend(outcome.cancelled_jobs);
            if let Some(at) = outcome.wake_at {
                stats.wakeups.push((key, at));
            }
        }

        if stats.rounds >= MAX_ROUNDS {
            warn!(trigger, rounds = stats.rounds, "recompute did not converge; bailing");
            break;
        }
    }

    stats
}

/// The dependency table: which dirty marks each entity mutation raises.
fn mark_from_changes(
    workspace: &mut Workspace,
    records: &[ChangeRecord],
    dirty: &mut DirtyTargets,
) {
    for record in records {
        match record.entity_type {
            // System membership gates every (deployment, environment)
            // pairing; systems change rarely enough to pay a full pass.
            EntityType::System => {
                workspace.targets.mark_all_dirty();
                dirty.mark_all();
            }

            EntityType::Deployment => {
                let id = DeploymentId::new(record.key.clone());
                workspace
                    .relationships
                    .mark_entity_dirty(RelationshipEntityType::Deployment, record.key.clone());
                workspace.targets.mark_deployment_dirty(id.clone());
                dirty.mark_deployment(id);
            }

            EntityType::Environment => {
                let id = EnvironmentId::new(record.key.clone());
                workspace
                    .relationships
                    .mark_entity_dirty(RelationshipEntityType::Environment, record.key.clone());
                workspace.targets.mark_environment_dirty(id.clone());
                dirty.mark_environment(id);
            }

            EntityType::Resource => {
                let id = ResourceId::new(record.key.clone());
                workspace
                    .relationships
                    .mark_entity_dirty(RelationshipEntityType::Resource, record.key.clone());
                workspace.targets.mark_resource_dirty(id.clone());
                dirty.mark_resource(id);
            }

            // Provider deletion nulls provider_id on owned resources,
            // which arrives here as Resource records of its own.
            EntityType::ResourceProvider => {}

            EntityType::JobAgent => {
                let referencing: Vec<DeploymentId> = workspace
                    .store
                    .deployments()
                    .filter(|d| {
                        d.job_agent_id
                            .as_ref()
                            .is_some_and(|id| id.as_str() == record.key)
                    })
                    .map(|d| d.id.clone())
                    .collect();
                for id in referencing {
                    dirty.mark_deployment(id);
                }
            }

            EntityType::DeploymentVersion | EntityType::DeploymentVariable => {
                if let Some(deployment_id) = record_field(record, "deployment_id") {
                    dirty.mark_deployment(DeploymentId::new(deployment_id));
                }
            }

            EntityType::DeploymentVariableValue => {
                let deployment = record_field(record, "variable_id")
                    .and_then(|id| workspace.store.variable(&id.into()))
                    .map(|v| v.deployment_id.clone());
                if let Some(id) = deployment {
                    dirty.mark_deployment(id);
                }
            }

            EntityType::ResourceVariable => {
                if let Some(resource_id) = record_field(record, "resource_id") {
                    dirty.mark_resource(ResourceId::new(resource_id));
                }
            }

            // Policy selectors can scope to any slice of the triple
            // space; re-derive everything.
            EntityType::Policy => dirty.mark_all(),

            EntityType::PolicySkip | EntityType::UserApprovalRecord => {
                let deployment = record_field(record, "version_id")
                    .and_then(|id| workspace.store.version(&id.into()))
                    .map(|v| v.deployment_id.clone());
                match deployment {
                    Some(id) => dirty.mark_deployment(id),
                    // The version is gone; too little context to narrow.
                    None => dirty.mark_all(),
                }
            }

            EntityType::RelationshipRule => {
                workspace.relationships.mark_all_dirty();
            }

            // Written by the engine itself during reconciliation and
            // job handling; re-marking them would spin the loop.
            EntityType::Release
            | EntityType::Job
            | EntityType::JobVerification
            | EntityType::WorkflowTemplate
            | EntityType::Workflow
            | EntityType::WorkflowRun
            | EntityType::WorkflowStep => {}
        }
    }
}

/// Read a string field off the record's after (falling back to before)
/// image.
fn record_field(record: &ChangeRecord, name: &str) -> Option<String> {
    record
        .after
        .as_ref()
        .or(record.before.as_ref())
        .and_then(|value| value.get(name))
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NoopTraceSink;
    use keel_types::{Deployment, DeploymentVersion, Environment, JobAgent, Resource, System};

    fn seeded_workspace() -> Workspace {
        let mut workspace = Workspace::new("ws-1");
        workspace
            .store
            .upsert_system(System::new("sys-1", "ws-1", "checkout"));
        workspace
            .store
            .upsert_job_agent(JobAgent::new("agent-1", "ws-1", "k8s", "kubernetes"));
        let mut deployment = Deployment::new("dep-1", "ws-1", "sys-1", "api");
        deployment.job_agent_id = Some("agent-1".into());
        workspace.store.upsert_deployment(deployment);
        workspace
            .store
            .upsert_environment(Environment::new("env-prod", "ws-1", "sys-1", "production"));
        workspace
            .store
            .upsert_resource(Resource::new("res-1", "ws-1", "cluster", "Kubernetes", "k8s/1"));
        workspace
    }

    #[test]
    fn test_recompute_converges_to_zero_work() {
        let mut workspace = seeded_workspace();
        let selectors = SelectorEngine::with_basic_evaluator();
        let release = ReleaseManager::new();
        let sink = NoopTraceSink;

        let stats = run_recompute(
            &mut workspace,
            &selectors,
            &release,
            &sink,
            DirtyTargets::new(),
            "test",
            Utc::now(),
        );
        assert_eq!(stats.targets_added, 1);

        let stats = run_recompute(
            &mut workspace,
            &selectors,
            &release,
            &sink,
            DirtyTargets::new(),
            "test",
            Utc::now(),
        );
        assert_eq!(stats.rounds, 0);
        assert_eq!(stats.selector_evaluations, 0);
        assert_eq!(stats.reconciled_targets, 0);
    }

    #[test]
    fn test_version_create_reconciles_its_deployment_targets() {
        let mut workspace = seeded_workspace();
        let selectors = SelectorEngine::with_basic_evaluator();
        let release = ReleaseManager::new();
        let sink = NoopTraceSink;

        run_recompute(
            &mut workspace,
            &selectors,
            &release,
            &sink,
            DirtyTargets::new(),
            "test",
            Utc::now(),
        );

        workspace.store.upsert_version(DeploymentVersion::new(
            "v-1",
            "ws-1",
            "dep-1",
            "1.0.0",
            Utc::now(),
        ));
        let stats = run_recompute(
            &mut workspace,
            &selectors,
            &release,
            &sink,
            DirtyTargets::new(),
            "version-create",
            Utc::now(),
        );
        assert_eq!(stats.reconciled_targets, 1);
        assert_eq!(stats.created_jobs.len(), 1);
    }

    #[test]
    fn test_reconcile_writes_do_not_spin_the_loop() {
        let mut workspace = seeded_workspace();
        workspace.store.upsert_version(DeploymentVersion::new(
            "v-1",
            "ws-1",
            "dep-1",
            "1.0.0",
            Utc::now(),
        ));
        let selectors = SelectorEngine::with_basic_evaluator();
        let release = ReleaseManager::new();
        let sink = NoopTraceSink;

        let stats = run_recompute(
            &mut workspace,
            &selectors,
            &release,
            &sink,
            DirtyTargets::new(),
            "test",
            Utc::now(),
        );
        assert!(stats.rounds < MAX_ROUNDS);
        assert_eq!(workspace.store.pending_change_count(), 0);
    }

    #[test]
    fn test_trace_phases_are_exported_per_target() {
        let mut workspace = seeded_workspace();
        workspace.store.upsert_version(DeploymentVersion::new(
            "v-1",
            "ws-1",
            "dep-1",
            "1.0.0",
            Utc::now(),
        ));
        let selectors = SelectorEngine::with_basic_evaluator();
        let release = ReleaseManager::new();
        let sink = crate::trace::InMemoryTraceSink::new();

        run_recompute(
            &mut workspace,
            &selectors,
            &release,
            &sink,
            DirtyTargets::new(),
            "version-create",
            Utc::now(),
        );

        let traces = sink.traces();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.trigger, "version-create");
        let names: Vec<&str> = trace.spans.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"Reconciliation"));
        assert!(names.contains(&"Planning"));
        assert!(names.contains(&"Eligibility"));
        assert!(names.contains(&"Execution"));
    }
}
