//! Error types for the SRM engine.
//!
//! Defines the errors shared across subsystems:
//! - Illegal job state transitions
//! - Scheduler admission and routing
//! - Request validation at the API boundary
//!
//! Persistence, backend and configuration errors live next to their modules
//! (`StorageError`, `BackendError`, `ConfigError`) and convert into
//! [`SrmError`].

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::job::{JobId, JobType, State};
use crate::storage::StorageError;

/// A transition that the state table does not allow. The job is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal state transition for job {job_id}: {from} -> {to}")]
pub struct IllegalStateTransition {
    pub job_id: JobId,
    pub from: State,
    pub to: State,
}

/// Errors raised by schedulers and the scheduler container.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler '{0}' is not running")]
    NotRunning(String),

    #[error("Scheduler '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Scheduler '{scheduler}' does not accept {job_type} jobs")]
    WrongJobType { scheduler: String, job_type: JobType },

    #[error("No scheduler registered for {0} jobs")]
    NoScheduler(JobType),

    #[error("Job {job_id} is not owned by scheduler '{scheduler}'")]
    NotOwned { job_id: JobId, scheduler: String },

    #[error("Job {0} is held by a worker")]
    Busy(JobId),
}

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum SrmError {
    #[error(transparent)]
    IllegalState(#[from] IllegalStateTransition),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid SURL: {0}")]
    InvalidSurl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown request id {0}")]
    UnknownJob(JobId),

    #[error("SRM has been shut down")]
    ShutDown,
}

impl SrmError {
    /// Whether the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SrmError::InvalidSurl(_)
                | SrmError::InvalidRequest(_)
                | SrmError::UnknownJob(_)
                | SrmError::IllegalState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_transition_message() {
        let err = IllegalStateTransition {
            job_id: JobId(9),
            from: State::Done,
            to: State::Running,
        };
        assert_eq!(
            err.to_string(),
            "Illegal state transition for job 9: DONE -> RUNNING"
        );
        let srm: SrmError = err.into();
        assert!(srm.is_client_error());
    }

    #[test]
    fn test_scheduler_error_message() {
        let err = SchedulerError::WrongJobType {
            scheduler: "get".to_string(),
            job_type: JobType::Put,
        };
        assert_eq!(err.to_string(), "Scheduler 'get' does not accept put jobs");
        assert!(!SrmError::from(err).is_client_error());
    }
}
