//! The workspace fact store
//!
//! One keyed collection per entity type, mutated only under the
//! workspace lock. Every mutator appends a change record to the current
//! changeset; the recompute loop drains it after each event.
//!
//! The store exclusively owns all entities. Collaborators hold ids and
//! come back here to look things up; queries tolerate dangling
//! references by filtering the affected rows.

use crate::change::{ChangeRecord, ChangeSet, EntityType};
use keel_types::{
    Deployment, DeploymentId, DeploymentVariable, DeploymentVariableValue, DeploymentVersion,
    Environment, EnvironmentId, GithubEntity, Job, JobAgent, JobAgentId, JobId, JobVerification,
    Policy, PolicyId, PolicySkip, RelationshipRule, RelationshipRuleId, Release, ReleaseId,
    Resource, ResourceId, ResourceProvider, ResourceProviderId, ResourceVariable, SkipId, System,
    SystemId, UserApprovalRecord, VariableId, VariableValueId, VerificationId, VersionId,
    VersionStatus, Workflow, WorkflowId, WorkflowRun, WorkflowRunId, WorkflowStep, WorkflowStepId,
    WorkflowTemplate, WorkflowTemplateId, WorkspaceId,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Keyed entity collections for one workspace.
#[derive(Debug, Default)]
pub struct WorkspaceStore {
    workspace_id: WorkspaceId,

    systems: BTreeMap<SystemId, System>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    environments: BTreeMap<EnvironmentId, Environment>,
    resources: BTreeMap<ResourceId, Resource>,
    resource_providers: BTreeMap<ResourceProviderId, ResourceProvider>,
    job_agents: BTreeMap<JobAgentId, JobAgent>,
    versions: BTreeMap<VersionId, DeploymentVersion>,
    variables: BTreeMap<VariableId, DeploymentVariable>,
    variable_values: BTreeMap<VariableValueId, DeploymentVariableValue>,
    resource_variables: BTreeMap<String, ResourceVariable>,
    policies: BTreeMap<PolicyId, Policy>,
    policy_skips: BTreeMap<SkipId, PolicySkip>,
    approvals: BTreeMap<String, UserApprovalRecord>,
    relationship_rules: BTreeMap<RelationshipRuleId, RelationshipRule>,
    github_entities: BTreeMap<String, GithubEntity>,
    releases: BTreeMap<ReleaseId, Release>,
    jobs: BTreeMap<JobId, Job>,
    verifications: BTreeMap<VerificationId, JobVerification>,
    workflow_templates: BTreeMap<WorkflowTemplateId, WorkflowTemplate>,
    workflows: BTreeMap<WorkflowId, Workflow>,
    workflow_runs: BTreeMap<WorkflowRunId, WorkflowRun>,
    workflow_steps: BTreeMap<WorkflowStepId, WorkflowStep>,

    // Secondary lookups
    releases_by_target: BTreeMap<String, BTreeSet<ReleaseId>>,
    jobs_by_release: BTreeMap<ReleaseId, BTreeSet<JobId>>,

    changeset: ChangeSet,
}

fn upsert<K: Ord + Clone, V: Serialize + Clone>(
    map: &mut BTreeMap<K, V>,
    changeset: &mut ChangeSet,
    entity_type: EntityType,
    key: K,
    key_str: String,
    value: V,
) -> ChangeRecord {
    let after = serde_json::to_value(&value).unwrap_or_default();
    let record = match map.insert(key, value) {
        Some(previous) => {
            let before = serde_json::to_value(&previous).unwrap_or_default();
            ChangeRecord::updated(entity_type, key_str, before, after)
        }
        None => ChangeRecord::created(entity_type, key_str, after),
    };
    changeset.push(record.clone());
    record
}

fn delete<K: Ord, V: Serialize>(
    map: &mut BTreeMap<K, V>,
    changeset: &mut ChangeSet,
    entity_type: EntityType,
    key: &K,
    key_str: String,
) -> Option<ChangeRecord> {
    map.remove(key).map(|previous| {
        let before = serde_json::to_value(&previous).unwrap_or_default();
        let record = ChangeRecord::deleted(entity_type, key_str, before);
        changeset.push(record.clone());
        record
    })
}

impl WorkspaceStore {
    pub fn new(workspace_id: impl Into<WorkspaceId>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            ..Self::default()
        }
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// Take every change recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<ChangeRecord> {
        self.changeset.drain()
    }

    pub fn pending_change_count(&self) -> usize {
        self.changeset.len()
    }

    // ── Systems ──────────────────────────────────────────────────────

    pub fn upsert_system(&mut self, system: System) -> ChangeRecord {
        let key = system.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.systems,
            &mut self.changeset,
            EntityType::System,
            key,
            key_str,
            system,
        )
    }

    pub fn delete_system(&mut self, id: &SystemId) -> Option<ChangeRecord> {
        delete(
            &mut self.systems,
            &mut self.changeset,
            EntityType::System,
            id,
            id.to_string(),
        )
    }

    pub fn system(&self, id: &SystemId) -> Option<&System> {
        self.systems.get(id)
    }

    pub fn systems(&self) -> impl Iterator<Item = &System> {
        self.systems.values()
    }

    // ── Deployments ──────────────────────────────────────────────────

    pub fn upsert_deployment(&mut self, deployment: Deployment) -> ChangeRecord {
        let key = deployment.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.deployments,
            &mut self.changeset,
            EntityType::Deployment,
            key,
            key_str,
            deployment,
        )
    }

    pub fn delete_deployment(&mut self, id: &DeploymentId) -> Option<ChangeRecord> {
        delete(
            &mut self.deployments,
            &mut self.changeset,
            EntityType::Deployment,
            id,
            id.to_string(),
        )
    }

    pub fn deployment(&self, id: &DeploymentId) -> Option<&Deployment> {
        self.deployments.get(id)
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    /// Link a deployment into an additional system.
    pub fn link_system_deployment(
        &mut self,
        system_id: &SystemId,
        deployment_id: &DeploymentId,
    ) -> Option<ChangeRecord> {
        let mut deployment = self.deployments.get(deployment_id)?.clone();
        if !deployment.linked_systems.insert(system_id.clone()) {
            return None;
        }
        Some(self.upsert_deployment(deployment))
    }

    /// Remove a deployment's additional system link.
    pub fn unlink_system_deployment(
        &mut self,
        system_id: &SystemId,
        deployment_id: &DeploymentId,
    ) -> Option<ChangeRecord> {
        let mut deployment = self.deployments.get(deployment_id)?.clone();
        if !deployment.linked_systems.remove(system_id) {
            return None;
        }
        Some(self.upsert_deployment(deployment))
    }

    // ── Environments ─────────────────────────────────────────────────

    pub fn upsert_environment(&mut self, environment: Environment) -> ChangeRecord {
        let key = environment.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.environments,
            &mut self.changeset,
            EntityType::Environment,
            key,
            key_str,
            environment,
        )
    }

    pub fn delete_environment(&mut self, id: &EnvironmentId) -> Option<ChangeRecord> {
        delete(
            &mut self.environments,
            &mut self.changeset,
            EntityType::Environment,
            id,
            id.to_string(),
        )
    }

    pub fn environment(&self, id: &EnvironmentId) -> Option<&Environment> {
        self.environments.get(id)
    }

    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn link_system_environment(
        &mut self,
        system_id: &SystemId,
        environment_id: &EnvironmentId,
    ) -> Option<ChangeRecord> {
        let mut environment = self.environments.get(environment_id)?.clone();
        if !environment.linked_systems.insert(system_id.clone()) {
            return None;
        }
        Some(self.upsert_environment(environment))
    }

    pub fn unlink_system_environment(
        &mut self,
        system_id: &SystemId,
        environment_id: &EnvironmentId,
    ) -> Option<ChangeRecord> {
        let mut environment = self.environments.get(environment_id)?.clone();
        if !environment.linked_systems.remove(system_id) {
            return None;
        }
        Some(self.upsert_environment(environment))
    }

    // ── Resources ────────────────────────────────────────────────────

    pub fn upsert_resource(&mut self, resource: Resource) -> ChangeRecord {
        let key = resource.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.resources,
            &mut self.changeset,
            EntityType::Resource,
            key,
            key_str,
            resource,
        )
    }

    pub fn delete_resource(&mut self, id: &ResourceId) -> Option<ChangeRecord> {
        delete(
            &mut self.resources,
            &mut self.changeset,
            EntityType::Resource,
            id,
            id.to_string(),
        )
    }

    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    // ── Resource providers ───────────────────────────────────────────

    pub fn upsert_resource_provider(&mut self, provider: ResourceProvider) -> ChangeRecord {
        let key = provider.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.resource_providers,
            &mut self.changeset,
            EntityType::ResourceProvider,
            key,
            key_str,
            provider,
        )
    }

    /// Delete a provider. Owned resources survive with `provider_id`
    /// nulled; each such resource produces its own update record.
    pub fn delete_resource_provider(
        &mut self,
        id: &ResourceProviderId,
    ) -> Option<ChangeRecord> {
        let record = delete(
            &mut self.resource_providers,
            &mut self.changeset,
            EntityType::ResourceProvider,
            id,
            id.to_string(),
        )?;

        let orphaned: Vec<Resource> = self
            .resources
            .values()
            .filter(|r| r.provider_id.as_ref() == Some(id))
            .cloned()
            .collect();
        for mut resource in orphaned {
            resource.provider_id = None;
            self.upsert_resource(resource);
        }

        Some(record)
    }

    pub fn resource_provider(&self, id: &ResourceProviderId) -> Option<&ResourceProvider> {
        self.resource_providers.get(id)
    }

    // ── Job agents ───────────────────────────────────────────────────

    pub fn upsert_job_agent(&mut self, agent: JobAgent) -> ChangeRecord {
        let key = agent.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.job_agents,
            &mut self.changeset,
            EntityType::JobAgent,
            key,
            key_str,
            agent,
        )
    }

    pub fn delete_job_agent(&mut self, id: &JobAgentId) -> Option<ChangeRecord> {
        delete(
            &mut self.job_agents,
            &mut self.changeset,
            EntityType::JobAgent,
            id,
            id.to_string(),
        )
    }

    pub fn job_agent(&self, id: &JobAgentId) -> Option<&JobAgent> {
        self.job_agents.get(id)
    }

    // ── Deployment versions ──────────────────────────────────────────

    pub fn upsert_version(&mut self, version: DeploymentVersion) -> ChangeRecord {
        let key = version.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.versions,
            &mut self.changeset,
            EntityType::DeploymentVersion,
            key,
            key_str,
            version,
        )
    }

    pub fn delete_version(&mut self, id: &VersionId) -> Option<ChangeRecord> {
        delete(
            &mut self.versions,
            &mut self.changeset,
            EntityType::DeploymentVersion,
            id,
            id.to_string(),
        )
    }

    pub fn version(&self, id: &VersionId) -> Option<&DeploymentVersion> {
        self.versions.get(id)
    }

    /// Ready versions of a deployment, newest first, ties broken by id.
    pub fn candidate_versions(&self, deployment_id: &DeploymentId) -> Vec<&DeploymentVersion> {
        let mut candidates: Vec<&DeploymentVersion> = self
            .versions
            .values()
            .filter(|v| &v.deployment_id == deployment_id && v.status == VersionStatus::Ready)
            .collect();
        candidates.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    // ── Variables ────────────────────────────────────────────────────

    pub fn upsert_variable(&mut self, variable: DeploymentVariable) -> ChangeRecord {
        let key = variable.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.variables,
            &mut self.changeset,
            EntityType::DeploymentVariable,
            key,
            key_str,
            variable,
        )
    }

    pub fn delete_variable(&mut self, id: &VariableId) -> Option<ChangeRecord> {
        delete(
            &mut self.variables,
            &mut self.changeset,
            EntityType::DeploymentVariable,
            id,
            id.to_string(),
        )
    }

    pub fn variable(&self, id: &VariableId) -> Option<&DeploymentVariable> {
        self.variables.get(id)
    }

    pub fn variables_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> impl Iterator<Item = &DeploymentVariable> {
        self.variables
            .values()
            .filter(move |v| &v.deployment_id == deployment_id)
    }

    pub fn upsert_variable_value(&mut self, value: DeploymentVariableValue) -> ChangeRecord {
        let key = value.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.variable_values,
            &mut self.changeset,
            EntityType::DeploymentVariableValue,
            key,
            key_str,
            value,
        )
    }

    pub fn delete_variable_value(&mut self, id: &VariableValueId) -> Option<ChangeRecord> {
        delete(
            &mut self.variable_values,
            &mut self.changeset,
            EntityType::DeploymentVariableValue,
            id,
            id.to_string(),
        )
    }

    pub fn values_for_variable(
        &self,
        variable_id: &VariableId,
    ) -> impl Iterator<Item = &DeploymentVariableValue> {
        self.variable_values
            .values()
            .filter(move |v| &v.variable_id == variable_id)
    }

    pub fn upsert_resource_variable(&mut self, variable: ResourceVariable) -> ChangeRecord {
        let key = ResourceVariable::store_key(&variable.resource_id, &variable.key);
        upsert(
            &mut self.resource_variables,
            &mut self.changeset,
            EntityType::ResourceVariable,
            key.clone(),
            key,
            variable,
        )
    }

    pub fn delete_resource_variable(
        &mut self,
        resource_id: &ResourceId,
        variable_key: &str,
    ) -> Option<ChangeRecord> {
        let key = ResourceVariable::store_key(resource_id, variable_key);
        delete(
            &mut self.resource_variables,
            &mut self.changeset,
            EntityType::ResourceVariable,
            &key.clone(),
            key,
        )
    }

    pub fn resource_variable(
        &self,
        resource_id: &ResourceId,
        variable_key: &str,
    ) -> Option<&ResourceVariable> {
        self.resource_variables
            .get(&ResourceVariable::store_key(resource_id, variable_key))
    }

    // ── Policies ─────────────────────────────────────────────────────

    pub fn upsert_policy(&mut self, policy: Policy) -> ChangeRecord {
        let key = policy.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.policies,
            &mut self.changeset,
            EntityType::Policy,
            key,
            key_str,
            policy,
        )
    }

    pub fn delete_policy(&mut self, id: &PolicyId) -> Option<ChangeRecord> {
        delete(
            &mut self.policies,
            &mut self.changeset,
            EntityType::Policy,
            id,
            id.to_string(),
        )
    }

    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn upsert_policy_skip(&mut self, skip: PolicySkip) -> ChangeRecord {
        let key = skip.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.policy_skips,
            &mut self.changeset,
            EntityType::PolicySkip,
            key,
            key_str,
            skip,
        )
    }

    pub fn delete_policy_skip(&mut self, id: &SkipId) -> Option<ChangeRecord> {
        delete(
            &mut self.policy_skips,
            &mut self.changeset,
            EntityType::PolicySkip,
            id,
            id.to_string(),
        )
    }

    pub fn skips_for_version(
        &self,
        version_id: &VersionId,
    ) -> impl Iterator<Item = &PolicySkip> {
        self.policy_skips
            .values()
            .filter(move |s| &s.version_id == version_id)
    }

    // ── Approvals ────────────────────────────────────────────────────

    /// Upsert keyed by (version, environment, user): a user changing
    /// their verdict replaces the prior record.
    pub fn upsert_approval(&mut self, record: UserApprovalRecord) -> ChangeRecord {
        let key = UserApprovalRecord::store_key(
            &record.version_id,
            &record.environment_id,
            &record.user_id,
        );
        upsert(
            &mut self.approvals,
            &mut self.changeset,
            EntityType::UserApprovalRecord,
            key.clone(),
            key,
            record,
        )
    }

    pub fn delete_approval(
        &mut self,
        version_id: &VersionId,
        environment_id: &EnvironmentId,
        user_id: &keel_types::UserId,
    ) -> Option<ChangeRecord> {
        let key = UserApprovalRecord::store_key(version_id, environment_id, user_id);
        delete(
            &mut self.approvals,
            &mut self.changeset,
            EntityType::UserApprovalRecord,
            &key.clone(),
            key,
        )
    }

    pub fn approvals_for(
        &self,
        version_id: &VersionId,
        environment_id: &EnvironmentId,
    ) -> impl Iterator<Item = &UserApprovalRecord> {
        self.approvals.values().filter(move |a| {
            &a.version_id == version_id && &a.environment_id == environment_id
        })
    }

    // ── Relationship rules ───────────────────────────────────────────

    pub fn upsert_relationship_rule(&mut self, rule: RelationshipRule) -> ChangeRecord {
        let key = rule.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.relationship_rules,
            &mut self.changeset,
            EntityType::RelationshipRule,
            key,
            key_str,
            rule,
        )
    }

    pub fn delete_relationship_rule(&mut self, id: &RelationshipRuleId) -> Option<ChangeRecord> {
        delete(
            &mut self.relationship_rules,
            &mut self.changeset,
            EntityType::RelationshipRule,
            id,
            id.to_string(),
        )
    }

    pub fn relationship_rules(&self) -> impl Iterator<Item = &RelationshipRule> {
        self.relationship_rules.values()
    }

    // ── Github entities ──────────────────────────────────────────────

    pub fn upsert_github_entity(&mut self, entity: GithubEntity) -> ChangeRecord {
        let key = entity.key();
        upsert(
            &mut self.github_entities,
            &mut self.changeset,
            EntityType::GithubEntity,
            key.clone(),
            key,
            entity,
        )
    }

    pub fn delete_github_entity(
        &mut self,
        slug: &str,
        installation_id: i64,
    ) -> Option<ChangeRecord> {
        let key = GithubEntity::store_key(slug, installation_id);
        delete(
            &mut self.github_entities,
            &mut self.changeset,
            EntityType::GithubEntity,
            &key.clone(),
            key,
        )
    }

    pub fn github_entity(&self, slug: &str, installation_id: i64) -> Option<&GithubEntity> {
        self.github_entities
            .get(&GithubEntity::store_key(slug, installation_id))
    }

    // ── Releases ─────────────────────────────────────────────────────

    pub fn insert_release(&mut self, release: Release) -> ChangeRecord {
        let key = release.id.clone();
        let key_str = key.to_string();
        self.releases_by_target
            .entry(release.target.key())
            .or_default()
            .insert(release.id.clone());
        upsert(
            &mut self.releases,
            &mut self.changeset,
            EntityType::Release,
            key,
            key_str,
            release,
        )
    }

    pub fn release(&self, id: &ReleaseId) -> Option<&Release> {
        self.releases.get(id)
    }

    pub fn releases_for_target(&self, target_key: &str) -> Vec<&Release> {
        self.releases_by_target
            .get(target_key)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.releases.get(id))
            .collect()
    }

    /// The existing release for a target + version, if materialized.
    pub fn release_for_target_version(
        &self,
        target_key: &str,
        version_id: &VersionId,
    ) -> Option<&Release> {
        self.releases_for_target(target_key)
            .into_iter()
            .find(|r| &r.version_id == version_id)
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    pub fn insert_job(&mut self, job: Job) -> ChangeRecord {
        if let Some(release_id) = &job.release_id {
            self.jobs_by_release
                .entry(release_id.clone())
                .or_default()
                .insert(job.id.clone());
        }
        let key = job.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.jobs,
            &mut self.changeset,
            EntityType::Job,
            key,
            key_str,
            job,
        )
    }

    pub fn update_job(&mut self, job: Job) -> ChangeRecord {
        self.insert_job(job)
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn jobs_for_release(&self, release_id: &ReleaseId) -> Vec<&Job> {
        self.jobs_by_release
            .get(release_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.jobs.get(id))
            .collect()
    }

    /// Jobs for a release target. Jobs whose release no longer resolves
    /// are filtered out rather than surfaced as dangling rows.
    pub fn jobs_for_release_target(&self, target_key: &str) -> Vec<&Job> {
        self.releases_for_target(target_key)
            .into_iter()
            .flat_map(|release| self.jobs_for_release(&release.id))
            .collect()
    }

    /// The most recently created job for a target, dangling-tolerant.
    pub fn latest_job_for_target(&self, target_key: &str) -> Option<&Job> {
        self.jobs_for_release_target(target_key)
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    }

    /// Jobs of one version across a deployment's targets in the given
    /// environments. Used by environment-progression policy checks.
    pub fn jobs_for_version_in_environments(
        &self,
        deployment_id: &DeploymentId,
        version_id: &VersionId,
        environment_ids: &BTreeSet<EnvironmentId>,
    ) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|job| {
                let Some(release_id) = &job.release_id else {
                    return false;
                };
                let Some(release) = self.releases.get(release_id) else {
                    return false;
                };
                &release.version_id == version_id
                    && &release.target.deployment_id == deployment_id
                    && environment_ids.contains(&release.target.environment_id)
            })
            .collect()
    }

    // ── Verifications ────────────────────────────────────────────────

    pub fn upsert_verification(&mut self, verification: JobVerification) -> ChangeRecord {
        let key = verification.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.verifications,
            &mut self.changeset,
            EntityType::JobVerification,
            key,
            key_str,
            verification,
        )
    }

    pub fn verification(&self, id: &VerificationId) -> Option<&JobVerification> {
        self.verifications.get(id)
    }

    pub fn verification_for_job(&self, job_id: &JobId) -> Option<&JobVerification> {
        self.verifications.values().find(|v| &v.job_id == job_id)
    }

    // ── Workflows ────────────────────────────────────────────────────

    pub fn upsert_workflow_template(&mut self, template: WorkflowTemplate) -> ChangeRecord {
        let key = template.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.workflow_templates,
            &mut self.changeset,
            EntityType::WorkflowTemplate,
            key,
            key_str,
            template,
        )
    }

    pub fn workflow_template(&self, id: &WorkflowTemplateId) -> Option<&WorkflowTemplate> {
        self.workflow_templates.get(id)
    }

    pub fn upsert_workflow(&mut self, workflow: Workflow) -> ChangeRecord {
        let key = workflow.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.workflows,
            &mut self.changeset,
            EntityType::Workflow,
            key,
            key_str,
            workflow,
        )
    }

    pub fn workflow(&self, id: &WorkflowId) -> Option<&Workflow> {
        self.workflows.get(id)
    }

    pub fn upsert_workflow_run(&mut self, run: WorkflowRun) -> ChangeRecord {
        let key = run.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.workflow_runs,
            &mut self.changeset,
            EntityType::WorkflowRun,
            key,
            key_str,
            run,
        )
    }

    pub fn workflow_run(&self, id: &WorkflowRunId) -> Option<&WorkflowRun> {
        self.workflow_runs.get(id)
    }

    pub fn upsert_workflow_step(&mut self, step: WorkflowStep) -> ChangeRecord {
        let key = step.id.clone();
        let key_str = key.to_string();
        upsert(
            &mut self.workflow_steps,
            &mut self.changeset,
            EntityType::WorkflowStep,
            key,
            key_str,
            step,
        )
    }

    pub fn workflow_step(&self, id: &WorkflowStepId) -> Option<&WorkflowStep> {
        self.workflow_steps.get(id)
    }

    /// Steps of a run in chain order.
    pub fn steps_for_run(&self, run_id: &WorkflowRunId) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self
            .workflow_steps
            .values()
            .filter(|s| &s.run_id == run_id)
            .collect();
        steps.sort_by_key(|s| s.index);
        steps
    }

    /// The step a workflow job executes, if any.
    pub fn step_for_job(&self, job_id: &JobId) -> Option<&WorkflowStep> {
        self.workflow_steps
            .values()
            .find(|s| s.job_id.as_ref() == Some(job_id))
    }

    // ── Snapshot access ──────────────────────────────────────────────

    pub(crate) fn collections(&self) -> StoreCollections<'_> {
        StoreCollections {
            systems: &self.systems,
            deployments: &self.deployments,
            environments: &self.environments,
            resources: &self.resources,
            resource_providers: &self.resource_providers,
            job_agents: &self.job_agents,
            versions: &self.versions,
            variables: &self.variables,
            variable_values: &self.variable_values,
            resource_variables: &self.resource_variables,
            policies: &self.policies,
            policy_skips: &self.policy_skips,
            approvals: &self.approvals,
            relationship_rules: &self.relationship_rules,
            github_entities: &self.github_entities,
            releases: &self.releases,
            jobs: &self.jobs,
            verifications: &self.verifications,
            workflow_templates: &self.workflow_templates,
            workflows: &self.workflows,
            workflow_runs: &self.workflow_runs,
            workflow_steps: &self.workflow_steps,
        }
    }

    /// Rebuild a store from snapshot collections. Secondary lookups are
    /// rederived here; derived indexes are rebuilt by the engine.
    pub(crate) fn from_collections(
        workspace_id: WorkspaceId,
        collections: OwnedStoreCollections,
    ) -> Self {
        let mut store = Self {
            workspace_id,
            systems: collections.systems,
            deployments: collections.deployments,
            environments: collections.environments,
            resources: collections.resources,
            resource_providers: collections.resource_providers,
            job_agents: collections.job_agents,
            versions: collections.versions,
            variables: collections.variables,
            variable_values: collections.variable_values,
            resource_variables: collections.resource_variables,
            policies: collections.policies,
            policy_skips: collections.policy_skips,
            approvals: collections.approvals,
            relationship_rules: collections.relationship_rules,
            github_entities: collections.github_entities,
            releases: collections.releases,
            jobs: collections.jobs,
            verifications: collections.verifications,
            workflow_templates: collections.workflow_templates,
            workflows: collections.workflows,
            workflow_runs: collections.workflow_runs,
            workflow_steps: collections.workflow_steps,
            releases_by_target: BTreeMap::new(),
            jobs_by_release: BTreeMap::new(),
            changeset: ChangeSet::new(),
        };
        for release in store.releases.values() {
            store
                .releases_by_target
                .entry(release.target.key())
                .or_default()
                .insert(release.id.clone());
        }
        for job in store.jobs.values() {
            if let Some(release_id) = &job.release_id {
                store
                    .jobs_by_release
                    .entry(release_id.clone())
                    .or_default()
                    .insert(job.id.clone());
            }
        }
        store
    }
}

/// Borrowed view of every collection, for snapshot encoding.
pub(crate) struct StoreCollections<'a> {
    pub systems: &'a BTreeMap<SystemId, System>,
    pub deployments: &'a BTreeMap<DeploymentId, Deployment>,
    pub environments: &'a BTreeMap<EnvironmentId, Environment>,
    pub resources: &'a BTreeMap<ResourceId, Resource>,
    pub resource_providers: &'a BTreeMap<ResourceProviderId, ResourceProvider>,
    pub job_agents: &'a BTreeMap<JobAgentId, JobAgent>,
    pub versions: &'a BTreeMap<VersionId, DeploymentVersion>,
    pub variables: &'a BTreeMap<VariableId, DeploymentVariable>,
    pub variable_values: &'a BTreeMap<VariableValueId, DeploymentVariableValue>,
    pub resource_variables: &'a BTreeMap<String, ResourceVariable>,
    pub policies: &'a BTreeMap<PolicyId, Policy>,
    pub policy_skips: &'a BTreeMap<SkipId, PolicySkip>,
    pub approvals: &'a BTreeMap<String, UserApprovalRecord>,
    pub relationship_rules: &'a BTreeMap<RelationshipRuleId, RelationshipRule>,
    pub github_entities: &'a BTreeMap<String, GithubEntity>,
    pub releases: &'a BTreeMap<ReleaseId, Release>,
    pub jobs: &'a BTreeMap<JobId, Job>,
    pub verifications: &'a BTreeMap<VerificationId, JobVerification>,
    pub workflow_templates: &'a BTreeMap<WorkflowTemplateId, WorkflowTemplate>,
    pub workflows: &'a BTreeMap<WorkflowId, Workflow>,
    pub workflow_runs: &'a BTreeMap<WorkflowRunId, WorkflowRun>,
    pub workflow_steps: &'a BTreeMap<WorkflowStepId, WorkflowStep>,
}

/// Owned collections decoded from a snapshot.
#[derive(Default)]
pub(crate) struct OwnedStoreCollections {
    pub systems: BTreeMap<SystemId, System>,
    pub deployments: BTreeMap<DeploymentId, Deployment>,
    pub environments: BTreeMap<EnvironmentId, Environment>,
    pub resources: BTreeMap<ResourceId, Resource>,
    pub resource_providers: BTreeMap<ResourceProviderId, ResourceProvider>,
    pub job_agents: BTreeMap<JobAgentId, JobAgent>,
    pub versions: BTreeMap<VersionId, DeploymentVersion>,
    pub variables: BTreeMap<VariableId, DeploymentVariable>,
    pub variable_values: BTreeMap<VariableValueId, DeploymentVariableValue>,
    pub resource_variables: BTreeMap<String, ResourceVariable>,
    pub policies: BTreeMap<PolicyId, Policy>,
    pub policy_skips: BTreeMap<SkipId, PolicySkip>,
    pub approvals: BTreeMap<String, UserApprovalRecord>,
    pub relationship_rules: BTreeMap<RelationshipRuleId, RelationshipRule>,
    pub github_entities: BTreeMap<String, GithubEntity>,
    pub releases: BTreeMap<ReleaseId, Release>,
    pub jobs: BTreeMap<JobId, Job>,
    pub verifications: BTreeMap<VerificationId, JobVerification>,
    pub workflow_templates: BTreeMap<WorkflowTemplateId, WorkflowTemplate>,
    pub workflows: BTreeMap<WorkflowId, Workflow>,
    pub workflow_runs: BTreeMap<WorkflowRunId, WorkflowRun>,
    pub workflow_steps: BTreeMap<WorkflowStepId, WorkflowStep>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use chrono::Utc;
    use keel_types::{DispatchContext, JobStatus, ReleaseTarget};

    fn store() -> WorkspaceStore {
        WorkspaceStore::new("ws-1")
    }

    #[test]
    fn test_upsert_produces_created_then_updated() {
        let mut store = store();
        let record = store.upsert_system(System::new("sys-1", "ws-1", "checkout"));
        assert_eq!(record.kind, ChangeKind::Created);

        let record = store.upsert_system(System::new("sys-1", "ws-1", "checkout-v2"));
        assert_eq!(record.kind, ChangeKind::Updated);
        assert!(record.before.is_some());
        assert_eq!(store.drain_changes().len(), 2);
    }

    #[test]
    fn test_delete_missing_is_none() {
        let mut store = store();
        assert!(store.delete_system(&SystemId::new("nope")).is_none());
        assert!(store.drain_changes().is_empty());
    }

    #[test]
    fn test_provider_delete_nulls_resource_provider_id() {
        let mut store = store();
        store.upsert_resource_provider(ResourceProvider::new("prov-1", "ws-1", "scanner"));
        let mut resource = Resource::new("res-1", "ws-1", "cluster", "Kubernetes", "k8s/1");
        resource.provider_id = Some(ResourceProviderId::new("prov-1"));
        store.upsert_resource(resource);
        store.drain_changes();

        store.delete_resource_provider(&ResourceProviderId::new("prov-1"));

        let resource = store.resource(&ResourceId::new("res-1")).unwrap();
        assert!(resource.provider_id.is_none());
        // one delete record + one resource update record
        assert_eq!(store.drain_changes().len(), 2);
    }

    #[test]
    fn test_candidate_versions_order() {
        let mut store = store();
        let base = Utc::now();
        for (id, offset) in [("v-a", 0), ("v-b", 60), ("v-c", 60)] {
            store.upsert_version(DeploymentVersion::new(
                id,
                "ws-1",
                "dep-1",
                "1.0.0",
                base + chrono::Duration::seconds(offset),
            ));
        }

        let ordered: Vec<_> = store
            .candidate_versions(&DeploymentId::new("dep-1"))
            .iter()
            .map(|v| v.id.as_str().to_string())
            .collect();
        // newest first; created_at tie between v-b and v-c broken by id
        assert_eq!(ordered, vec!["v-b", "v-c", "v-a"]);
    }

    #[test]
    fn test_jobs_for_target_filters_dangling_release() {
        let mut store = store();
        let target = ReleaseTarget::new("dep-1", "env-1", "res-1");
        let now = Utc::now();

        let job = Job {
            id: JobId::new("job-1"),
            workspace_id: WorkspaceId::new("ws-1"),
            release_id: Some(ReleaseId::new("rel-missing")),
            workflow_step_id: None,
            job_agent_id: None,
            job_agent_config: Default::default(),
            status: JobStatus::Pending,
            dispatch_context: DispatchContext::default(),
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        store.insert_job(job);

        // The release was never materialized (corrupt snapshot); the
        // query must omit the job rather than panic.
        assert!(store.jobs_for_release_target(&target.key()).is_empty());
        assert!(store.latest_job_for_target(&target.key()).is_none());
    }

    #[test]
    fn test_link_unlink_system_deployment() {
        let mut store = store();
        store.upsert_deployment(Deployment::new("dep-1", "ws-1", "sys-1", "api"));
        store.drain_changes();

        let record = store
            .link_system_deployment(&SystemId::new("sys-2"), &DeploymentId::new("dep-1"))
            .unwrap();
        assert_eq!(record.kind, ChangeKind::Updated);

        // Linking twice is a no-op and records nothing
        assert!(store
            .link_system_deployment(&SystemId::new("sys-2"), &DeploymentId::new("dep-1"))
            .is_none());

        let deployment = store.deployment(&DeploymentId::new("dep-1")).unwrap();
        assert!(deployment.linked_systems.contains(&SystemId::new("sys-2")));

        store
            .unlink_system_deployment(&SystemId::new("sys-2"), &DeploymentId::new("dep-1"))
            .unwrap();
        let deployment = store.deployment(&DeploymentId::new("dep-1")).unwrap();
        assert!(deployment.linked_systems.is_empty());
    }
}
