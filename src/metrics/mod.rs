//! Metrics module for Prometheus-based monitoring.
//!
//! Records job transitions, scheduler occupancy and storage backend calls.
//!
//! # Example
//!
//! ```ignore
//! use srm_engine::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_backend_call("pin", "success", elapsed);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, SchedulerGauges};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BACKEND_CALLS_TOTAL, BACKEND_LATENCY, JOBS_RUNNING, JOB_DURATION, JOB_TRANSITIONS_TOTAL,
    MAX_ACTIVE_JOBS, QUEUE_DEPTH, REGISTRY, STORAGE_FAILURES_TOTAL,
};
