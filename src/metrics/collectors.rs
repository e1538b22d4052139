//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    BACKEND_CALLS_TOTAL, BACKEND_LATENCY, JOBS_RUNNING, JOB_DURATION, JOB_TRANSITIONS_TOTAL,
    MAX_ACTIVE_JOBS, QUEUE_DEPTH, STORAGE_FAILURES_TOTAL,
};
use crate::job::{JobType, State};

/// Snapshot of one scheduler's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerGauges {
    pub queued: usize,
    pub running: usize,
    pub max_active_jobs: usize,
}

/// Metrics collector for recording SRM operational metrics.
///
/// # Example
///
/// ```ignore
/// use srm_engine::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_transition(JobType::Get, State::Queued);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job state transition.
    pub fn record_transition(&self, job_type: JobType, to: State) {
        if let Some(transitions) = JOB_TRANSITIONS_TOTAL.get() {
            transitions
                .with_label_values(&[job_type.as_str(), to.as_str()])
                .inc();
        }
    }

    /// Record how long a worker held a job and the state it produced.
    pub fn record_job_processed(&self, job_type: JobType, outcome: State, elapsed: Duration) {
        if let Some(duration) = JOB_DURATION.get() {
            duration
                .with_label_values(&[job_type.as_str(), outcome.as_str()])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            job_type = %job_type,
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded job processing metric"
        );
    }

    /// Update the occupancy gauges of a scheduler.
    pub fn update_scheduler(&self, job_type: JobType, gauges: SchedulerGauges) {
        let label = [job_type.as_str()];
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&label).set(gauges.queued as f64);
        }
        if let Some(running) = JOBS_RUNNING.get() {
            running.with_label_values(&label).set(gauges.running as f64);
        }
        if let Some(max_active) = MAX_ACTIVE_JOBS.get() {
            max_active
                .with_label_values(&label)
                .set(gauges.max_active_jobs as f64);
        }
    }

    /// Record a storage backend call.
    ///
    /// # Arguments
    ///
    /// * `operation` - Backend method name (e.g., "prepare_to_get")
    /// * `status` - "success" or the error label
    /// * `elapsed` - Call latency
    pub fn record_backend_call(&self, operation: &str, status: &str, elapsed: Duration) {
        if let Some(calls) = BACKEND_CALLS_TOTAL.get() {
            calls.with_label_values(&[operation, status]).inc();
        }
        if let Some(latency) = BACKEND_LATENCY.get() {
            latency
                .with_label_values(&[operation])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            operation = operation,
            status = status,
            latency_ms = elapsed.as_millis() as u64,
            "Recorded backend call metric"
        );
    }

    pub fn record_storage_failure(&self) {
        if let Some(failures) = STORAGE_FAILURES_TOTAL.get() {
            failures.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_before_and_after_init() {
        let collector = MetricsCollector::new();
        // Must not panic whether or not metrics are initialized
        collector.record_transition(JobType::Put, State::Queued);

        let _ = init_metrics();
        collector.record_transition(JobType::Put, State::Running);
        collector.record_job_processed(JobType::Put, State::Ready, Duration::from_millis(20));
        collector.update_scheduler(
            JobType::Put,
            SchedulerGauges {
                queued: 3,
                running: 2,
                max_active_jobs: 2,
            },
        );
        collector.record_backend_call("prepare_to_put", "success", Duration::from_millis(3));
        collector.record_storage_failure();

        let text = export_metrics();
        assert!(text.contains("srm_queue_depth"));
        assert!(text.contains("srm_backend_calls_total"));
    }
}
