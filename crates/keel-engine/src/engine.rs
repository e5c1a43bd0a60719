//! Engine aggregate
//!
//! The front door of the workspace engine: a typed event dispatcher
//! over the workspace registry. One inbound event is one atomic unit of
//! work: decode, mutate the store, recompute derived state, reconcile
//! dirtied targets, all under the target workspace's lock. Work that
//! must not hold the lock (verification measurements, policy wake-up
//! timers) re-enters through channels as synthetic work items.

use crate::error::Result;
use crate::handlers::{apply_event, AppliedEvent};
use crate::recompute::{run_recompute, DirtyTargets, RecomputeStats};
use crate::registry::WorkspaceRegistry;
use crate::trace::{NoopTraceSink, TraceSink};
use crate::workspace::Workspace;
use chrono::Utc;
use keel_release::{
    JobUpdateOutcome, ReleaseManager, VerificationManager, VerificationResolution,
};
use keel_selector::{BasicEvaluator, ExpressionEvaluator, SelectorEngine};
use keel_store::SnapshotStorage;
use keel_types::{
    EngineEvent, EngineEventEnvelope, EngineEventSeverity, EngineEventSource, JobId,
    WorkspaceEvent, WorkspaceId,
};
use keel_workflow::{WorkflowAdvance, WorkflowEngine};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A policy `Pending(until)` verdict, fired back as a reconcile once
/// the instant passes.
#[derive(Debug)]
struct ReconcileWakeup {
    workspace_id: WorkspaceId,
    target_key: String,
}

const EVENT_STREAM_CAPACITY: usize = 256;

/// The workspace engine. Cheap to share behind an [`Arc`]; all
/// per-workspace state lives in the registry.
pub struct Engine {
    registry: WorkspaceRegistry,
    selectors: SelectorEngine,
    release: ReleaseManager,
    workflows: WorkflowEngine,
    verifications: VerificationManager,
    resolutions_rx: Mutex<mpsc::UnboundedReceiver<VerificationResolution>>,
    wakeups_tx: mpsc::UnboundedSender<ReconcileWakeup>,
    wakeups_rx: Mutex<mpsc::UnboundedReceiver<ReconcileWakeup>>,
    events_tx: broadcast::Sender<EngineEventEnvelope>,
    trace_sink: Arc<dyn TraceSink>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Engine with the built-in expression evaluator.
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self::with_evaluator(storage, Arc::new(BasicEvaluator::new()))
    }

    /// Engine with a host-provided expression evaluator (shared between
    /// selectors and verification conditions).
    pub fn with_evaluator(
        storage: Arc<dyn SnapshotStorage>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        let (resolutions_tx, resolutions_rx) = mpsc::unbounded_channel();
        let (wakeups_tx, wakeups_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            registry: WorkspaceRegistry::new(storage),
            selectors: SelectorEngine::new(evaluator.clone()),
            release: ReleaseManager::new(),
            workflows: WorkflowEngine::new(),
            verifications: VerificationManager::new(evaluator, resolutions_tx),
            resolutions_rx: Mutex::new(resolutions_rx),
            wakeups_tx,
            wakeups_rx: Mutex::new(wakeups_rx),
            events_tx,
            trace_sink: Arc::new(NoopTraceSink),
            shutdown_tx,
        }
    }

    /// Replace the trace exporter (defaults to discarding).
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = sink;
        self
    }

    /// Workspace lifecycle owner, for hosts that need direct access.
    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    /// Subscribe to the observability stream. Lagging or absent
    /// subscribers never affect engine semantics.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEventEnvelope> {
        self.events_tx.subscribe()
    }

    /// Apply one inbound event: decode, mutate, recompute, reconcile.
    /// A decode failure rejects the event with the store unchanged.
    #[instrument(skip(self, event), fields(kind = %event.kind, workspace_id = %event.workspace_id))]
    pub async fn handle_event(&self, event: WorkspaceEvent) -> Result<RecomputeStats> {
        let handle = self
            .registry
            .get_or_load(&event.workspace_id, &self.selectors)
            .await?;
        let mut workspace = handle.lock().await;
        let now = Utc::now();

        let applied = match apply_event(
            &mut workspace,
            &self.release,
            &self.workflows,
            &event,
            now,
        ) {
            Ok(applied) => applied,
            Err(error) => {
                self.publish(
                    &event.workspace_id,
                    EngineEventSource::Dispatcher,
                    EngineEventSeverity::Warning,
                    EngineEvent::EventRejected {
                        kind: event.kind,
                        reason: error.to_string(),
                    },
                );
                return Err(error);
            }
        };

        let mut seed = DirtyTargets::new();
        match applied {
            AppliedEvent::Mutation => {}
            AppliedEvent::JobUpdated(outcome) => {
                self.follow_up_job_update(&mut workspace, &outcome, &mut seed, now);
            }
            AppliedEvent::WorkflowRunCreated(advance) => {
                self.publish_workflow_advance(&workspace, &advance);
            }
        }

        let stats = run_recompute(
            &mut workspace,
            &self.selectors,
            &self.release,
            self.trace_sink.as_ref(),
            seed,
            event.kind.as_str(),
            now,
        );
        self.publish_recompute(&workspace, &stats);

        self.publish(
            &event.workspace_id,
            EngineEventSource::Dispatcher,
            EngineEventSeverity::Debug,
            EngineEvent::EventApplied { kind: event.kind },
        );
        debug!(
            reconciled = stats.reconciled_targets,
            created = stats.created_jobs.len(),
            "event applied"
        );
        Ok(stats)
    }

    /// Re-derive everything for one workspace (snapshot restore, host
    /// resync).
    pub async fn reconcile_workspace(
        &self,
        workspace_id: &WorkspaceId,
        trigger: &str,
    ) -> Result<RecomputeStats> {
        let handle = self
            .registry
            .get_or_load(workspace_id, &self.selectors)
            .await?;
        let mut workspace = handle.lock().await;
        let mut seed = DirtyTargets::new();
        seed.mark_all();
        let stats = run_recompute(
            &mut workspace,
            &self.selectors,
            &self.release,
            self.trace_sink.as_ref(),
            seed,
            trigger,
            Utc::now(),
        );
        self.publish_recompute(&workspace, &stats);
        Ok(stats)
    }

    /// Re-reconcile a single target (policy wake-up path).
    pub async fn reconcile_target(
        &self,
        workspace_id: &WorkspaceId,
        target_key: &str,
        trigger: &str,
    ) -> Result<RecomputeStats> {
        let handle = self
            .registry
            .get_or_load(workspace_id, &self.selectors)
            .await?;
        let mut workspace = handle.lock().await;
        let mut seed = DirtyTargets::new();
        seed.mark_key(target_key);
        let stats = run_recompute(
            &mut workspace,
            &self.selectors,
            &self.release,
            self.trace_sink.as_ref(),
            seed,
            trigger,
            Utc::now(),
        );
        self.publish_recompute(&workspace, &stats);
        Ok(stats)
    }

    /// Background pump: verification resolutions and policy wake-ups,
    /// until shutdown.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }

    /// Drive the background channels on the caller's task.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                resolution = async { self.resolutions_rx.lock().await.recv().await } => {
                    match resolution {
                        Some(resolution) => {
                            if let Err(error) = self.apply_resolution(resolution).await {
                                warn!(%error, "failed to apply verification resolution");
                            }
                        }
                        None => break,
                    }
                }
                wakeup = async { self.wakeups_rx.lock().await.recv().await } => {
                    match wakeup {
                        Some(wakeup) => {
                            if let Err(error) = self
                                .reconcile_target(
                                    &wakeup.workspace_id,
                                    &wakeup.target_key,
                                    "policy-wakeup",
                                )
                                .await
                            {
                                warn!(%error, "policy wake-up reconcile failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Apply the next pending verification resolution, waiting for one
    /// to arrive. For hosts (and tests) driving the engine manually
    /// instead of through [`Engine::start`].
    pub async fn pump_verification(&self) -> Result<Option<RecomputeStats>> {
        let resolution = { self.resolutions_rx.lock().await.recv().await };
        match resolution {
            Some(resolution) => self.apply_resolution(resolution).await.map(Some),
            None => Ok(None),
        }
    }

    /// Signal every long-running task, wait for verifications to
    /// observe cancellation, then snapshot every live workspace out.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.verifications.shutdown().await;
        for workspace_id in self.registry.workspace_ids() {
            if let Some(snapshot) = self.registry.snapshot(&workspace_id).await? {
                self.publish(
                    &workspace_id,
                    EngineEventSource::Registry,
                    EngineEventSeverity::Info,
                    EngineEvent::SnapshotTaken {
                        entity_count: snapshot.metadata.entity_count,
                    },
                );
            }
        }
        info!("engine shut down");
        Ok(())
    }

    async fn apply_resolution(&self, resolution: VerificationResolution) -> Result<RecomputeStats> {
        let handle = self
            .registry
            .get_or_load(&resolution.workspace_id, &self.selectors)
            .await?;
        let mut workspace = handle.lock().await;
        let now = Utc::now();

        let target_key = self.release.apply_verification_result(
            &mut workspace.store,
            &resolution.verification_id,
            resolution.measurements,
            resolution.passed,
            now,
        );
        self.verifications.finish(&resolution.job_id);

        self.publish(
            &resolution.workspace_id,
            EngineEventSource::Verification,
            if resolution.passed {
                EngineEventSeverity::Info
            } else {
                EngineEventSeverity::Warning
            },
            EngineEvent::VerificationResolved {
                job_id: resolution.job_id.clone(),
                passed: resolution.passed,
            },
        );
        if resolution.passed {
            if let Some(key) = &target_key {
                self.publish_release_current(&workspace, &resolution.job_id, key);
            }
        }

        let mut seed = DirtyTargets::new();
        if let Some(key) = target_key {
            seed.mark_key(key);
        }
        let stats = run_recompute(
            &mut workspace,
            &self.selectors,
            &self.release,
            self.trace_sink.as_ref(),
            seed,
            "verification",
            now,
        );
        self.publish_recompute(&workspace, &stats);
        Ok(stats)
    }

    /// Follow-ups after an external job transition: verification start,
    /// current-release announcement, workflow advancement, and the
    /// dirty seed for the target the job converges.
    fn follow_up_job_update(
        &self,
        workspace: &mut Workspace,
        outcome: &JobUpdateOutcome,
        seed: &mut DirtyTargets,
        now: chrono::DateTime<Utc>,
    ) {
        let workspace_id = workspace.workspace_id().clone();
        self.publish(
            &workspace_id,
            EngineEventSource::ReleaseManager,
            EngineEventSeverity::Info,
            EngineEvent::JobTransitioned {
                job_id: outcome.job.id.clone(),
                status: format!("{:?}", outcome.job.status),
            },
        );

        if let Some((verification_id, metrics)) = &outcome.verification_to_start {
            self.verifications.start_verification(
                workspace_id.clone(),
                verification_id.clone(),
                outcome.job.id.clone(),
                metrics.clone(),
            );
            self.publish(
                &workspace_id,
                EngineEventSource::Verification,
                EngineEventSeverity::Info,
                EngineEvent::VerificationStarted {
                    job_id: outcome.job.id.clone(),
                },
            );
        }
        if outcome.became_current {
            if let Some(key) = &outcome.release_target_key {
                self.publish_release_current(workspace, &outcome.job.id, key);
            }
        }

        if let Some(advance) = self
            .workflows
            .advance_on_job_update(&mut workspace.store, &outcome.job, now)
        {
            self.publish_workflow_advance(workspace, &advance);
        }

        // A terminal job can unblock sibling targets waiting on
        // environment progression, so the whole deployment re-derives.
        let target = outcome
            .job
            .release_id
            .as_ref()
            .and_then(|id| workspace.store.release(id))
            .map(|release| release.target.clone());
        if let Some(target) = target {
            seed.mark_key(target.key());
            seed.mark_deployment(target.deployment_id);
        }
    }

    fn publish_workflow_advance(&self, workspace: &Workspace, advance: &WorkflowAdvance) {
        let workspace_id = workspace.workspace_id();
        if let Some(step_index) = advance.step_index {
            self.publish(
                workspace_id,
                EngineEventSource::Workflow,
                EngineEventSeverity::Info,
                EngineEvent::WorkflowAdvanced {
                    run_id: advance.run_id.to_string(),
                    step_index,
                },
            );
        }
        if let Some(job_id) = &advance.created_job {
            self.publish(
                workspace_id,
                EngineEventSource::Workflow,
                EngineEventSeverity::Info,
                EngineEvent::JobCreated {
                    job_id: job_id.clone(),
                    release_target_key: None,
                },
            );
        }
    }

    fn publish_recompute(&self, workspace: &Workspace, stats: &RecomputeStats) {
        let workspace_id = workspace.workspace_id();
        for job_id in &stats.created_jobs {
            let release_target_key = workspace
                .store
                .job(job_id)
                .and_then(|job| job.release_id.as_ref())
                .and_then(|release_id| workspace.store.release(release_id))
                .map(|release| release.target.key());
            self.publish(
                workspace_id,
                EngineEventSource::ReleaseManager,
                EngineEventSeverity::Info,
                EngineEvent::JobCreated {
                    job_id: job_id.clone(),
                    release_target_key,
                },
            );
        }
        for job_id in &stats.cancelled_jobs {
            self.publish(
                workspace_id,
                EngineEventSource::ReleaseManager,
                EngineEventSeverity::Info,
                EngineEvent::JobTransitioned {
                    job_id: job_id.clone(),
                    status: "Cancelled".to_string(),
                },
            );
        }
        for (target_key, at) in &stats.wakeups {
            self.schedule_wakeup(workspace_id.clone(), target_key.clone(), *at);
        }
    }

    fn publish_release_current(&self, workspace: &Workspace, job_id: &JobId, target_key: &str) {
        let version_tag = workspace
            .store
            .job(job_id)
            .and_then(|job| job.release_id.as_ref())
            .and_then(|release_id| workspace.store.release(release_id))
            .and_then(|release| workspace.store.version(&release.version_id))
            .map(|version| version.tag.clone())
            .unwrap_or_default();
        self.publish(
            workspace.workspace_id(),
            EngineEventSource::ReleaseManager,
            EngineEventSeverity::Info,
            EngineEvent::ReleaseCurrent {
                release_target_key: target_key.to_string(),
                version_tag,
            },
        );
    }

    /// Post a reconcile for `target_key` once `at` passes. The timer
    /// task holds no workspace state; firing re-enters through the
    /// wake-up channel.
    fn schedule_wakeup(
        &self,
        workspace_id: WorkspaceId,
        target_key: String,
        at: chrono::DateTime<Utc>,
    ) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let tx = self.wakeups_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        debug!(%workspace_id, target = %target_key, ?delay, "policy wake-up scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(ReconcileWakeup {
                        workspace_id,
                        target_key,
                    });
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    fn publish(
        &self,
        workspace_id: &WorkspaceId,
        source: EngineEventSource,
        severity: EngineEventSeverity,
        event: EngineEvent,
    ) {
        // Dropped when nobody subscribes.
        let _ = self.events_tx.send(EngineEventEnvelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            severity,
            workspace_id: workspace_id.clone(),
            event,
        });
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workspaces", &self.registry.len())
            .field("active_verifications", &self.verifications.active_count())
            .finish()
    }
}
