//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the SRM engine and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all SRM metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Job state transitions, labeled by job type and target state.
pub static JOB_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time a worker spent processing a job, labeled by job type and outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs waiting in a scheduler queue, labeled by job type.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs held by workers, labeled by job type.
pub static JOBS_RUNNING: OnceLock<GaugeVec> = OnceLock::new();

/// Configured active job bound, labeled by job type.
pub static MAX_ACTIVE_JOBS: OnceLock<GaugeVec> = OnceLock::new();

/// Storage backend calls, labeled by operation and status.
pub static BACKEND_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Storage backend call latency in seconds, labeled by operation.
pub static BACKEND_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Failed job saves.
pub static STORAGE_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the first registry stays
/// in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let job_transitions_total = CounterVec::new(
        Opts::new("srm_job_transitions_total", "Total number of job state transitions"),
        &["job_type", "state"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "srm_job_processing_seconds",
            "Time spent by a worker processing a job",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job_type", "outcome"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("srm_queue_depth", "Number of jobs waiting in a scheduler queue"),
        &["job_type"],
    )?;

    let jobs_running = GaugeVec::new(
        Opts::new("srm_jobs_running", "Number of jobs held by workers"),
        &["job_type"],
    )?;

    let max_active_jobs = GaugeVec::new(
        Opts::new("srm_max_active_jobs", "Configured bound on running jobs"),
        &["job_type"],
    )?;

    let backend_calls_total = CounterVec::new(
        Opts::new("srm_backend_calls_total", "Total storage backend calls"),
        &["operation", "status"],
    )?;

    let backend_latency = HistogramVec::new(
        HistogramOpts::new(
            "srm_backend_latency_seconds",
            "Storage backend call latency in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["operation"],
    )?;

    let storage_failures_total = Counter::new(
        "srm_storage_failures_total",
        "Total job saves that failed",
    )?;

    registry.register(Box::new(job_transitions_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_running.clone()))?;
    registry.register(Box::new(max_active_jobs.clone()))?;
    registry.register(Box::new(backend_calls_total.clone()))?;
    registry.register(Box::new(backend_latency.clone()))?;
    registry.register(Box::new(storage_failures_total.clone()))?;

    // Already-set cells mean metrics were initialized before
    let _ = REGISTRY.set(registry);
    let _ = JOB_TRANSITIONS_TOTAL.set(job_transitions_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_RUNNING.set(jobs_running);
    let _ = MAX_ACTIVE_JOBS.set(max_active_jobs);
    let _ = BACKEND_CALLS_TOTAL.set(backend_calls_total);
    let _ = BACKEND_LATENCY.set(backend_latency);
    let _ = STORAGE_FAILURES_TOTAL.set(storage_failures_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(transitions) = JOB_TRANSITIONS_TOTAL.get() {
            transitions.with_label_values(&["get", "DONE"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("srm_job_transitions_total"));
    }
}
