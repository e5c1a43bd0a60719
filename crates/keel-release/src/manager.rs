//! Release manager
//!
//! Drives each release target through its convergence state machine.
//! Reconciliation is re-entrant and rebuilds its view from the store
//! every pass; running it twice in a row without a fact change performs
//! no writes.

use crate::dispatch::release_dispatch_context;
use crate::error::{ReleaseError, Result};
use chrono::{DateTime, Utc};
use keel_index::{resolve_variables, RelationshipIndex, ReleaseTargetIndex};
use keel_policy::{PolicyEvalContext, PolicyEvaluator, RuleCheck};
use keel_selector::SelectorEngine;
use keel_store::WorkspaceStore;
use keel_types::{
    merge_job_agent_config, ConfigMap, DeploymentVersion, Job, JobId, JobStatus, Release,
    ReleaseId, ReleaseTarget, VerificationId, VerificationMetricSpec, VerificationStatus,
};
use tracing::{debug, info, instrument};

/// Read-only collaborators a reconcile pass needs alongside the store.
pub struct ReconcileDeps<'a> {
    pub targets: &'a ReleaseTargetIndex,
    pub relationships: &'a RelationshipIndex,
    pub selectors: &'a SelectorEngine,
}

/// Trace notes emitted during a reconcile pass, consumed by the
/// tracing spine.
#[derive(Debug, Clone)]
pub enum ReconcileNote {
    /// Why nothing (or something) was decided
    Decision(String),

    /// A side effect taken on the store
    Action(String),
}

/// What one reconcile pass did.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Job created this pass, if any
    pub created_job: Option<JobId>,

    /// Processing jobs cancelled this pass
    pub cancelled_jobs: Vec<JobId>,

    /// Earliest pending-rule wake-up across candidates
    pub wake_at: Option<DateTime<Utc>>,

    /// Per-rule verdicts, in evaluation order
    pub checks: Vec<RuleCheck>,

    /// Decision/action notes for the trace
    pub notes: Vec<ReconcileNote>,
}

impl ReconcileOutcome {
    fn decide(&mut self, message: impl Into<String>) {
        self.notes.push(ReconcileNote::Decision(message.into()));
    }

    fn act(&mut self, message: impl Into<String>) {
        self.notes.push(ReconcileNote::Action(message.into()));
    }
}

/// Outcome of an external job update.
#[derive(Debug)]
pub struct JobUpdateOutcome {
    /// The job after the transition
    pub job: Job,

    /// Target the job's release converges, when it resolves
    pub release_target_key: Option<String>,

    /// Verification to start: the job just succeeded and its release
    /// carries metric specs
    pub verification_to_start: Option<(VerificationId, Vec<VerificationMetricSpec>)>,

    /// The release became current immediately (no verification
    /// configured)
    pub became_current: bool,
}

/// Per-target convergence driver. Stateless; all state lives in the
/// store.
#[derive(Default)]
pub struct ReleaseManager {
    policies: PolicyEvaluator,
}

impl ReleaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// One idempotent reconcile pass over a target.
    #[instrument(skip_all, fields(target = %target.key()))]
    pub fn reconcile_target(
        &self,
        store: &mut WorkspaceStore,
        deps: &ReconcileDeps<'_>,
        target: &ReleaseTarget,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let target_key = target.key();

        let Some(deployment) = store.deployment(&target.deployment_id).cloned() else {
            outcome.decide("deployment no longer exists");
            outcome.cancelled_jobs = self.cancel_processing_jobs(store, &target_key, now);
            return outcome;
        };

        // Phase 1: resolve the desired release among ready candidates,
        // newest first, stopping at the first permitted one.
        let candidates: Vec<DeploymentVersion> = store
            .candidate_versions(&target.deployment_id)
            .into_iter()
            .cloned()
            .collect();
        if candidates.is_empty() {
            outcome.decide("no ready versions for deployment");
        }

        let mut desired: Option<DeploymentVersion> = None;
        for version in candidates {
            let ctx = PolicyEvalContext::new(store, deps.targets, deps.selectors, now);
            let decision = self.policies.evaluate(&ctx, target, &version);
            outcome.checks.extend(decision.checks.iter().cloned());

            if decision.permitted() {
                outcome.decide(format!("version {} permitted", version.tag));
                desired = Some(version);
                break;
            }
            if let Some(wake) = decision.wake_at() {
                outcome.wake_at = Some(match outcome.wake_at {
                    Some(existing) => existing.min(wake),
                    None => wake,
                });
                outcome.decide(format!("version {} pending until {}", version.tag, wake));
            } else {
                outcome.decide(format!(
                    "version {} blocked: {}",
                    version.tag,
                    decision.block_reason().unwrap_or("no reason recorded")
                ));
            }
        }

        let latest_job = store.latest_job_for_target(&target_key).cloned();

        // Phase 2: converge the job state onto the desired release.
        let Some(version) = desired else {
            // Nothing should run. A processing job whose release no
            // longer resolves is cancelled; anything else is left as-is.
            if let Some(job) = latest_job {
                if job.status.is_processing() {
                    let release_resolves = job
                        .release_id
                        .as_ref()
                        .and_then(|id| store.release(id))
                        .is_some();
                    if !release_resolves {
                        self.cancel_job(store, &job.id, now);
                        outcome.act(format!("cancelled job {} (release gone)", job.id));
                        outcome.cancelled_jobs.push(job.id);
                    }
                }
            }
            outcome.decide("no desired release");
            return outcome;
        };

        let release = self.materialize_release(store, deps, target, &version, now, &mut outcome);

        if let Some(job) = &latest_job {
            if job.status.is_processing() {
                if job.release_id.as_ref() == Some(&release.id) {
                    // Already converging to the desired release.
                    outcome.decide("processing job already matches desired release");
                    return outcome;
                }
                self.cancel_job(store, &job.id, now);
                outcome.act(format!("cancelled superseded job {}", job.id));
                outcome.cancelled_jobs.push(job.id.clone());
            }
        }

        // A release is attempted once: an existing pending, running,
        // finished, or skipped job suppresses re-creation. Cancelled
        // jobs do not (the cancellation reflected a superseded desire,
        // not a verdict on the release), and agent markers are handled
        // below.
        let existing = store.jobs_for_release(&release.id);
        let has_attempt = existing.iter().any(|j| {
            !matches!(j.status, JobStatus::InvalidJobAgent | JobStatus::Cancelled)
        });
        if has_attempt {
            outcome.decide("release already has a job");
            return outcome;
        }
        let has_agent_marker = existing
            .iter()
            .any(|j| j.status == JobStatus::InvalidJobAgent);

        let agent = deployment
            .job_agent_id
            .as_ref()
            .and_then(|id| store.job_agent(id))
            .cloned();

        match agent {
            None => {
                if has_agent_marker {
                    outcome.decide("no job agent configured; marker job already present");
                    return outcome;
                }
                let merged = merge_job_agent_config(
                    &ConfigMap::new(),
                    &deployment.job_agent_config,
                    &version.job_agent_config,
                );
                let job = Job {
                    id: JobId::generate(),
                    workspace_id: store.workspace_id().clone(),
                    release_id: Some(release.id.clone()),
                    workflow_step_id: None,
                    job_agent_id: None,
                    job_agent_config: merged,
                    status: JobStatus::InvalidJobAgent,
                    dispatch_context: release_dispatch_context(
                        store,
                        target,
                        &version,
                        None,
                        &release.variables,
                    ),
                    message: Some("deployment has no job agent configured".to_string()),
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                };
                let job_id = job.id.clone();
                store.insert_job(job);
                info!(%job_id, target = %target_key, "created invalid-job-agent marker");
                outcome.act(format!("created invalid-job-agent marker {job_id}"));
                outcome.created_job = Some(job_id);
            }
            Some(agent) => {
                let merged = merge_job_agent_config(
                    &agent.config,
                    &deployment.job_agent_config,
                    &version.job_agent_config,
                );
                let job = Job {
                    id: JobId::generate(),
                    workspace_id: store.workspace_id().clone(),
                    release_id: Some(release.id.clone()),
                    workflow_step_id: None,
                    job_agent_id: Some(agent.id.clone()),
                    job_agent_config: merged,
                    status: JobStatus::Pending,
                    dispatch_context: release_dispatch_context(
                        store,
                        target,
                        &version,
                        Some(&agent),
                        &release.variables,
                    ),
                    message: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                };
                let job_id = job.id.clone();
                store.insert_job(job);
                info!(%job_id, target = %target_key, version = %version.tag, "created pending job");
                outcome.act(format!("created pending job {job_id}"));
                outcome.created_job = Some(job_id);
            }
        }

        outcome
    }

    /// The target disappeared from the materializer: cancel whatever is
    /// still in flight for it.
    pub fn reconcile_removed_target(
        &self,
        store: &mut WorkspaceStore,
        target_key: &str,
        now: DateTime<Utc>,
    ) -> Vec<JobId> {
        let cancelled = self.cancel_processing_jobs(store, target_key, now);
        if !cancelled.is_empty() {
            info!(target = target_key, count = cancelled.len(), "cancelled jobs for removed target");
        }
        cancelled
    }

    /// Apply an externally reported job transition.
    pub fn apply_job_update(
        &self,
        store: &mut WorkspaceStore,
        job_id: &JobId,
        status: JobStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobUpdateOutcome> {
        let mut job = store
            .job(job_id)
            .cloned()
            .ok_or_else(|| ReleaseError::JobNotFound(job_id.clone()))?;
        job.transition(status, now)?;
        if message.is_some() {
            job.message = message;
        }
        store.update_job(job.clone());
        debug!(%job_id, ?status, "applied job update");

        let release = job
            .release_id
            .as_ref()
            .and_then(|id| store.release(id))
            .cloned();
        let release_target_key = release.as_ref().map(|r| r.target.key());

        let mut verification_to_start = None;
        let mut became_current = false;
        if status == JobStatus::Successful {
            if let Some(release) = &release {
                if release.verification_metrics.is_empty() {
                    became_current = true;
                } else {
                    let verification = keel_types::JobVerification {
                        id: VerificationId::generate(),
                        workspace_id: store.workspace_id().clone(),
                        job_id: job.id.clone(),
                        metrics: release.verification_metrics.clone(),
                        measurements: Vec::new(),
                        status: VerificationStatus::Running,
                        started_at: now,
                        resolved_at: None,
                    };
                    let verification_id = verification.id.clone();
                    store.upsert_verification(verification);
                    verification_to_start =
                        Some((verification_id, release.verification_metrics.clone()));
                }
            }
        }

        Ok(JobUpdateOutcome {
            job,
            release_target_key,
            verification_to_start,
            became_current,
        })
    }

    /// Record a resolved verification. Returns the target key so the
    /// caller can re-reconcile and re-derive the current release.
    pub fn apply_verification_result(
        &self,
        store: &mut WorkspaceStore,
        verification_id: &VerificationId,
        measurements: Vec<keel_types::Measurement>,
        passed: bool,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let mut verification = store.verification(verification_id)?.clone();
        verification.measurements = measurements;
        verification.status = if passed {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };
        verification.resolved_at = Some(now);
        let job_id = verification.job_id.clone();
        store.upsert_verification(verification);
        info!(%verification_id, %job_id, passed, "verification resolved");

        store
            .job(&job_id)
            .and_then(|job| job.release_id.as_ref())
            .and_then(|release_id| store.release(release_id))
            .map(|release| release.target.key())
    }

    /// Mark a running verification cancelled (shutdown or job
    /// supersession); measurement tasks observe the signal separately.
    pub fn cancel_verification_for_job(
        &self,
        store: &mut WorkspaceStore,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) {
        if let Some(verification) = store.verification_for_job(job_id) {
            if verification.status == VerificationStatus::Running {
                let mut verification = verification.clone();
                verification.status = VerificationStatus::Cancelled;
                verification.resolved_at = Some(now);
                store.upsert_verification(verification);
            }
        }
    }

    fn materialize_release(
        &self,
        store: &mut WorkspaceStore,
        deps: &ReconcileDeps<'_>,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
        now: DateTime<Utc>,
        outcome: &mut ReconcileOutcome,
    ) -> Release {
        let target_key = target.key();
        if let Some(existing) = store.release_for_target_version(&target_key, &version.id) {
            return existing.clone();
        }

        let resolved =
            resolve_variables(store, deps.relationships, deps.selectors, target);
        for warning in &resolved.warnings {
            outcome.decide(format!("variable warning: {warning}"));
        }

        let deployment = store.deployment(&target.deployment_id);
        let agent_config = deployment
            .and_then(|d| d.job_agent_id.as_ref())
            .and_then(|id| store.job_agent(id))
            .map(|a| a.config.clone())
            .unwrap_or_default();
        let deployment_config = deployment
            .map(|d| d.job_agent_config.clone())
            .unwrap_or_default();
        let verification_metrics = deployment
            .map(|d| d.verification_metrics.clone())
            .unwrap_or_default();

        let release = Release {
            id: ReleaseId::generate(),
            workspace_id: store.workspace_id().clone(),
            target: target.clone(),
            version_id: version.id.clone(),
            variables: resolved.values,
            job_agent_config: merge_job_agent_config(
                &agent_config,
                &deployment_config,
                &version.job_agent_config,
            ),
            verification_metrics,
            created_at: now,
        };
        store.insert_release(release.clone());
        outcome.act(format!(
            "materialized release {} for version {}",
            release.id, version.tag
        ));
        release
    }

    fn cancel_processing_jobs(
        &self,
        store: &mut WorkspaceStore,
        target_key: &str,
        now: DateTime<Utc>,
    ) -> Vec<JobId> {
        let processing: Vec<JobId> = store
            .jobs_for_release_target(target_key)
            .into_iter()
            .filter(|job| job.status.is_processing())
            .map(|job| job.id.clone())
            .collect();
        for job_id in &processing {
            self.cancel_job(store, job_id, now);
        }
        processing
    }

    fn cancel_job(&self, store: &mut WorkspaceStore, job_id: &JobId, now: DateTime<Utc>) {
        if let Some(job) = store.job(job_id) {
            let mut job = job.clone();
            if job.transition(JobStatus::Cancelled, now).is_ok() {
                store.update_job(job);
            }
        }
    }
}
