//! srm-engine: request scheduling engine for a storage resource manager.
//!
//! This library accepts SRM requests (get, put, copy, bring-online, ls and
//! space reservation), tracks each one as a persistent state machine,
//! schedules file requests per job type under admission limits, and
//! restores active requests after a restart.

// Core modules
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod request;
pub mod scheduler;
pub mod srm;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, SchedulerConfig, SrmConfig, StorageKind};
pub use error::{IllegalStateTransition, SchedulerError, SrmError};
pub use job::{Job, JobId, JobType, State};
pub use srm::{Srm, SrmHandle};
pub use storage::StorageError;
