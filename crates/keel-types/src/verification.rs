//! Verification metric specs and records

use crate::{JobId, VerificationId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How one verification metric is measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationMetricSpec {
    /// Metric name, unique within the spec list
    pub name: String,

    /// Spacing between measurements
    pub interval_seconds: u64,

    /// Maximum number of measurements
    pub count: u32,

    /// Expression over the measurement result deciding success, e.g.
    /// `result.ok == true`
    pub success_condition: String,

    /// Early-exit once this many cumulative successes are observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,

    /// Where measurements come from
    pub provider: MetricProvider,
}

/// Measurement source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricProvider {
    /// Waits, then reports `{"ok": true}`. Useful as a soak timer and
    /// in tests.
    Sleep { duration_seconds: u64 },
}

/// One recorded measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Metric the measurement belongs to
    pub metric: String,

    /// When it was taken
    pub taken_at: DateTime<Utc>,

    /// Raw provider result
    pub result: Value,

    /// Outcome of the success condition
    pub passed: bool,
}

/// Verification lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Verification record for a job: the specs it runs under plus every
/// measurement taken so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVerification {
    /// Unique verification identifier
    pub id: VerificationId,

    /// Owning workspace
    pub workspace_id: WorkspaceId,

    /// Job being verified
    pub job_id: JobId,

    /// Metric specs the verification runs under
    pub metrics: Vec<VerificationMetricSpec>,

    /// Measurements recorded so far
    #[serde(default)]
    pub measurements: Vec<Measurement>,

    /// Lifecycle status
    pub status: VerificationStatus,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl JobVerification {
    /// Whether every metric has at least one passing measurement.
    pub fn all_metrics_passed(&self) -> bool {
        self.metrics.iter().all(|spec| {
            self.measurements
                .iter()
                .any(|m| m.metric == spec.name && m.passed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> VerificationMetricSpec {
        VerificationMetricSpec {
            name: name.to_string(),
            interval_seconds: 1,
            count: 3,
            success_condition: "result.ok == true".to_string(),
            success_threshold: None,
            provider: MetricProvider::Sleep {
                duration_seconds: 0,
            },
        }
    }

    #[test]
    fn test_all_metrics_passed() {
        let now = Utc::now();
        let mut verification = JobVerification {
            id: VerificationId::new("ver-1"),
            workspace_id: WorkspaceId::new("ws-1"),
            job_id: JobId::new("job-1"),
            metrics: vec![spec("latency"), spec("errors")],
            measurements: vec![Measurement {
                metric: "latency".to_string(),
                taken_at: now,
                result: json!({"ok": true}),
                passed: true,
            }],
            status: VerificationStatus::Running,
            started_at: now,
            resolved_at: None,
        };

        assert!(!verification.all_metrics_passed());

        verification.measurements.push(Measurement {
            metric: "errors".to_string(),
            taken_at: now,
            result: json!({"ok": true}),
            passed: true,
        });
        assert!(verification.all_metrics_passed());
    }
}
