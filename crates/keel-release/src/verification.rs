//! Verification manager
//!
//! Runs verification measurements for succeeded jobs on independent
//! tasks, outside the workspace lock. Results re-enter the engine as
//! resolutions on a channel; the dispatcher applies them under the lock
//! like any other event. Tasks honor a watch-channel shutdown signal
//! and stop cooperatively.

use futures::future::join_all;
use dashmap::DashMap;
use keel_selector::{ExpressionContext, ExpressionEvaluator};
use keel_types::{
    JobId, Measurement, MetricProvider, VerificationId, VerificationMetricSpec, WorkspaceId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A resolved verification, delivered back to the engine.
#[derive(Debug)]
pub struct VerificationResolution {
    pub workspace_id: WorkspaceId,
    pub verification_id: VerificationId,
    pub job_id: JobId,
    pub measurements: Vec<Measurement>,
    pub passed: bool,
}

struct VerificationTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one task group per verified job.
pub struct VerificationManager {
    evaluator: Arc<dyn ExpressionEvaluator>,
    resolutions_tx: mpsc::UnboundedSender<VerificationResolution>,
    tasks: DashMap<JobId, VerificationTask>,
}

impl VerificationManager {
    pub fn new(
        evaluator: Arc<dyn ExpressionEvaluator>,
        resolutions_tx: mpsc::UnboundedSender<VerificationResolution>,
    ) -> Self {
        Self {
            evaluator,
            resolutions_tx,
            tasks: DashMap::new(),
        }
    }

    /// Number of jobs currently being verified.
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Start measurement tasks for a job. One task per metric; the
    /// verification resolves once every metric finishes.
    pub fn start_verification(
        &self,
        workspace_id: WorkspaceId,
        verification_id: VerificationId,
        job_id: JobId,
        metrics: Vec<VerificationMetricSpec>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let evaluator = self.evaluator.clone();
        let resolutions_tx = self.resolutions_tx.clone();
        let task_job_id = job_id.clone();

        let handle = tokio::spawn(async move {
            let measurements: Arc<Mutex<Vec<Measurement>>> = Arc::new(Mutex::new(Vec::new()));
            let mut metric_tasks = Vec::new();
            for spec in metrics {
                metric_tasks.push(run_metric(
                    spec,
                    evaluator.clone(),
                    measurements.clone(),
                    shutdown_rx.clone(),
                ));
            }
            let results = join_all(metric_tasks).await;

            if *shutdown_rx.borrow() {
                debug!(job_id = %task_job_id, "verification cancelled before resolution");
                return;
            }

            let passed = results.iter().all(|r| *r == MetricOutcome::Passed);
            let measurements = measurements.lock().await.clone();
            let resolution = VerificationResolution {
                workspace_id,
                verification_id,
                job_id: task_job_id.clone(),
                measurements,
                passed,
            };
            if resolutions_tx.send(resolution).is_err() {
                warn!(job_id = %task_job_id, "engine dropped the resolution channel");
            }
        });

        info!(%job_id, "verification started");
        self.tasks.insert(
            job_id,
            VerificationTask {
                shutdown_tx,
                handle,
            },
        );
    }

    /// Cooperatively stop every measurement task for a job. The
    /// verification record keeps its terminal status in the store.
    pub fn stop_verifications_for_job(&self, job_id: &JobId) {
        if let Some((_, task)) = self.tasks.remove(job_id) {
            let _ = task.shutdown_tx.send(true);
            info!(%job_id, "verification stop requested");
        }
    }

    /// Signal every task and wait for them to observe cancellation.
    pub async fn shutdown(&self) {
        let job_ids: Vec<JobId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::new();
        for job_id in job_ids {
            if let Some((_, task)) = self.tasks.remove(&job_id) {
                let _ = task.shutdown_tx.send(true);
                handles.push(task.handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Drop the bookkeeping entry once a resolution is applied.
    pub fn finish(&self, job_id: &JobId) {
        self.tasks.remove(job_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricOutcome {
    Passed,
    Failed,
    Cancelled,
}

/// Run one metric to completion: up to `count` measurements spaced by
/// `interval_seconds`, early-exiting once cumulative successes reach
/// `success_threshold` (or a success becomes impossible without one).
async fn run_metric(
    spec: VerificationMetricSpec,
    evaluator: Arc<dyn ExpressionEvaluator>,
    measurements: Arc<Mutex<Vec<Measurement>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> MetricOutcome {
    // Without an explicit threshold every measurement must pass.
    let required = spec.success_threshold.unwrap_or(spec.count);
    let mut successes = 0u32;

    for attempt in 0..spec.count {
        if attempt > 0 {
            let wait = Duration::from_secs(spec.interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => return MetricOutcome::Cancelled,
            }
        }

        let result = tokio::select! {
            result = measure(&spec.provider) => result,
            _ = wait_for_shutdown(&mut shutdown_rx) => return MetricOutcome::Cancelled,
        };

        let context = ExpressionContext::new().with_root("result", result.clone());
        let passed = evaluator
            .evaluate_bool(&spec.success_condition, &context)
            .unwrap_or_else(|error| {
                warn!(metric = %spec.name, %error, "success condition failed to evaluate");
                false
            });

        measurements.lock().await.push(Measurement {
            metric: spec.name.clone(),
            taken_at: chrono::Utc::now(),
            result,
            passed,
        });

        if passed {
            successes += 1;
            if successes >= required {
                return MetricOutcome::Passed;
            }
        } else {
            let remaining = spec.count - attempt - 1;
            if successes + remaining < required {
                // No way to reach the threshold; stop measuring early.
                return MetricOutcome::Failed;
            }
        }
    }

    if successes >= required {
        MetricOutcome::Passed
    } else {
        MetricOutcome::Failed
    }
}

/// Resolve only when the shutdown signal flips to true. A closed
/// channel never resolves; task teardown is then the join handle's job.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn measure(provider: &MetricProvider) -> Value {
    match provider {
        MetricProvider::Sleep { duration_seconds } => {
            tokio::time::sleep(Duration::from_secs(*duration_seconds)).await;
            json!({"ok": true})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_selector::BasicEvaluator;

    fn spec(count: u32, threshold: Option<u32>) -> VerificationMetricSpec {
        VerificationMetricSpec {
            name: "health".to_string(),
            interval_seconds: 10,
            count,
            success_condition: "result.ok == true".to_string(),
            success_threshold: threshold,
            provider: MetricProvider::Sleep { duration_seconds: 1 },
        }
    }

    fn manager() -> (
        VerificationManager,
        mpsc::UnboundedReceiver<VerificationResolution>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            VerificationManager::new(Arc::new(BasicEvaluator::new()), tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_passes_and_resolves() {
        let (manager, mut rx) = manager();
        manager.start_verification(
            "ws-1".into(),
            "ver-1".into(),
            "job-1".into(),
            vec![spec(3, None)],
        );

        let resolution = rx.recv().await.unwrap();
        assert!(resolution.passed);
        assert_eq!(resolution.measurements.len(), 3);
        assert_eq!(resolution.job_id.as_str(), "job-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_early_exit() {
        let (manager, mut rx) = manager();
        manager.start_verification(
            "ws-1".into(),
            "ver-1".into(),
            "job-1".into(),
            vec![spec(10, Some(2))],
        );

        let resolution = rx.recv().await.unwrap();
        assert!(resolution.passed);
        // Early exit after two cumulative successes, not ten
        assert_eq!(resolution.measurements.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_cooperative_and_silent() {
        let (manager, mut rx) = manager();
        manager.start_verification(
            "ws-1".into(),
            "ver-1".into(),
            "job-1".into(),
            vec![spec(100, None)],
        );
        assert_eq!(manager.active_count(), 1);

        manager.stop_verifications_for_job(&"job-1".into());
        manager.shutdown().await;

        // A cancelled verification never delivers a resolution
        assert!(rx.try_recv().is_err());
    }
}
