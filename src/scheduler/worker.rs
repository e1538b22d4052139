//! The contract between a scheduler and the code that processes its jobs.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::BackendError;
use crate::job::Job;

/// Successful result of processing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Finished; the job becomes `Done`.
    Done(String),
    /// A transfer URL is available; the job goes through `RQueued` to `Ready`.
    Ready(String),
    /// Waiting on something outside the worker, e.g. child requests.
    AsyncWait(String),
}

impl Outcome {
    pub fn description(&self) -> &str {
        match self {
            Outcome::Done(d) | Outcome::Ready(d) | Outcome::AsyncWait(d) => d,
        }
    }
}

/// Failed processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// Permanent failure; the job becomes `Failed`.
    #[error("{0}")]
    Fatal(String),

    /// May succeed later; the job is retried while retries remain.
    #[error("{0}")]
    Transient(String),

    /// The processor acknowledged a cancel request.
    #[error("{0}")]
    Canceled(String),
}

impl From<BackendError> for JobFailure {
    fn from(err: BackendError) -> Self {
        if err.is_transient() {
            JobFailure::Transient(err.to_string())
        } else {
            JobFailure::Fatal(err.to_string())
        }
    }
}

/// What a processor sees of the job it works on.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<Job>,
}

impl JobContext {
    pub fn new(job: Arc<Job>) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Whether cancellation (or expiry) has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.job.cancel_token().is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.job.cancel_token().cancelled().await
    }
}

/// Processing of one job type.
///
/// Runs on a worker task; returned errors and panics are converted into
/// job states and never reach the dispatch loop.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: &JobContext) -> Result<Outcome, JobFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_conversion() {
        assert_eq!(
            JobFailure::from(BackendError::Timeout("pool".into())),
            JobFailure::Transient("Timed out: pool".into())
        );
        assert!(matches!(
            JobFailure::from(BackendError::InvalidPath("/x".into())),
            JobFailure::Fatal(_)
        ));
    }
}
