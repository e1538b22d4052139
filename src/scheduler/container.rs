//! Registry of schedulers by job type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tracing::{error, info, warn};

use super::info::{describe, SchedulerInfo};
use super::listener::{Listeners, StateChangeListener};
use super::scheduler::Scheduler;
use super::worker::JobProcessor;
use crate::config::SrmConfig;
use crate::error::{SchedulerError, SrmError};
use crate::job::{Job, JobId, JobRegistry, JobType, State, Transition, EXPIRED_DESCRIPTION};
use crate::metrics::MetricsCollector;
use crate::storage::JobStorage;

/// Outcome of startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Active records rebuilt into live jobs.
    pub restored: usize,
    /// Restored jobs that had already outlived their lifetime.
    pub expired: usize,
    /// Records that could not be re-admitted.
    pub failed: usize,
}

/// One scheduler per job type plus the shared listeners and storage.
///
/// Routes jobs by their runtime type and fans administrative operations
/// out to every scheduler.
pub struct SchedulerContainer {
    schedulers: BTreeMap<JobType, Arc<Scheduler>>,
    storage: Arc<dyn JobStorage>,
    listeners: Listeners,
}

impl SchedulerContainer {
    /// Creates a scheduler for every job type, all sharing `processor`.
    pub fn new(
        config: &SrmConfig,
        processor: Arc<dyn JobProcessor>,
        storage: Arc<dyn JobStorage>,
        listeners: Listeners,
    ) -> Self {
        let schedulers = JobType::ALL
            .into_iter()
            .map(|job_type| {
                let scheduler = Scheduler::new(
                    job_type,
                    config.scheduler(job_type),
                    processor.clone(),
                    storage.clone(),
                    listeners.clone(),
                );
                (job_type, scheduler)
            })
            .collect();
        Self {
            schedulers,
            storage,
            listeners,
        }
    }

    pub fn scheduler(&self, job_type: JobType) -> Result<&Arc<Scheduler>, SchedulerError> {
        self.schedulers
            .get(&job_type)
            .ok_or(SchedulerError::NoScheduler(job_type))
    }

    pub fn schedulers(&self) -> impl Iterator<Item = &Arc<Scheduler>> {
        self.schedulers.values()
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.add(listener);
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        for scheduler in self.schedulers.values() {
            scheduler.start()?;
        }
        Ok(())
    }

    /// Routes a job to the scheduler of its type.
    pub async fn schedule(&self, job: Arc<Job>) -> Result<(), SrmError> {
        self.scheduler(job.job_type())?.schedule(job).await
    }

    /// (active + queued) / max_active_jobs of one scheduler.
    pub fn load(&self, job_type: JobType) -> Result<f64, SchedulerError> {
        Ok(self.scheduler(job_type)?.load())
    }

    pub fn set_max_ready_jobs(&self, job_type: JobType, max: usize) -> Result<(), SchedulerError> {
        self.scheduler(job_type)?.set_max_active_jobs(max);
        Ok(())
    }

    pub fn infos(&self) -> Vec<SchedulerInfo> {
        self.schedulers.values().map(|s| s.info()).collect()
    }

    /// One summary block per scheduler.
    pub fn info(&self) -> String {
        self.infos()
            .iter()
            .map(|info| info.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn detailed_info(&self, job_type: JobType) -> Result<String, SchedulerError> {
        Ok(self.scheduler(job_type)?.detailed_info())
    }

    /// The scheduler currently tracking a job, if any.
    fn owner(&self, id: JobId) -> Option<&Arc<Scheduler>> {
        self.schedulers.values().find(|s| s.get(id).is_some())
    }

    pub fn find_job(&self, id: JobId) -> Option<Arc<Job>> {
        self.schedulers.values().find_map(|s| s.get(id))
    }

    /// Cancels a job tracked by any scheduler.
    pub async fn cancel(&self, id: JobId, reason: &str) -> Result<(), SrmError> {
        match self.owner(id) {
            Some(scheduler) => scheduler.cancel(id, reason).await,
            None => Err(SrmError::UnknownJob(id)),
        }
    }

    /// Cancels every tracked job whose description line matches `pattern`.
    /// Returns the ids the cancel was applied to.
    pub async fn cancel_matching(&self, pattern: &str, reason: &str) -> Result<Vec<JobId>, SrmError> {
        let regex = Regex::new(pattern)
            .map_err(|e| SrmError::InvalidRequest(format!("bad pattern '{}': {}", pattern, e)))?;
        let matching: Vec<JobId> = self
            .schedulers
            .values()
            .flat_map(|s| s.jobs())
            .filter(|job| regex.is_match(&describe(job)))
            .map(|job| job.id())
            .collect();

        let mut canceled = Vec::with_capacity(matching.len());
        for id in matching {
            match self.cancel(id, reason).await {
                Ok(()) => canceled.push(id),
                Err(e) => warn!(job_id = %id, error = %e, "Could not cancel matching job"),
            }
        }
        Ok(canceled)
    }

    /// Applies a transition through the job's owner.
    ///
    /// Jobs not tracked by any scheduler (unscheduled containers, or file
    /// requests never admitted) are transitioned directly, then saved and
    /// announced the same way a scheduler would.
    pub async fn transition(
        &self,
        job: &Arc<Job>,
        to: State,
        description: &str,
    ) -> Result<Transition, SrmError> {
        if let Some(scheduler) = self.owner(job.id()) {
            return scheduler.transition(job, to, description).await;
        }
        let transition = job.transition(to, description)?;
        job.save(self.storage.as_ref(), false).await;
        MetricsCollector::new().record_transition(job.job_type(), to);
        self.listeners.notify(job, transition);
        Ok(transition)
    }

    /// Rebuilds every active job from storage and re-admits it.
    ///
    /// All rebuilt jobs are registered before any is re-admitted, so
    /// containers and children can find each other while states change.
    pub async fn restore(&self, registry: &JobRegistry) -> Result<RecoveryReport, SrmError> {
        let records = self.storage.get_active_jobs().await?;
        let jobs: Vec<Arc<Job>> = records
            .into_iter()
            .map(|record| Arc::new(Job::from_record(record)))
            .collect();
        for job in &jobs {
            registry.insert(job.clone());
        }

        let mut report = RecoveryReport::default();
        let now = chrono::Utc::now();
        for job in jobs {
            report.restored += 1;
            if job.is_expired_at(now) {
                report.expired += 1;
            }
            let result = if job.is_scheduled() {
                self.schedule_restored(&job).await
            } else {
                self.restore_unscheduled(&job, now).await
            };
            if let Err(e) = result {
                report.failed += 1;
                error!(job_id = %job.id(), error = %e, "Could not restore job");
            }
        }

        info!(
            restored = report.restored,
            expired = report.expired,
            failed = report.failed,
            "Recovered active jobs from storage"
        );
        Ok(report)
    }

    async fn schedule_restored(&self, job: &Arc<Job>) -> Result<(), SrmError> {
        self.scheduler(job.job_type())?.restore(job.clone()).await
    }

    async fn restore_unscheduled(
        &self,
        job: &Arc<Job>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SrmError> {
        if job.state() != State::Restored {
            self.transition(job, State::Restored, "Restored after restart.")
                .await?;
        }
        if job.is_expired_at(now) {
            self.transition(job, State::Failed, EXPIRED_DESCRIPTION).await?;
        } else {
            self.transition(job, State::AsyncWait, "Waiting for file requests after restart.")
                .await?;
        }
        Ok(())
    }

    /// Shuts every scheduler down concurrently. Returns the ids still held by
    /// workers when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> Vec<JobId> {
        let leftovers = join_all(self.schedulers.values().map(|s| s.shutdown(grace))).await;
        let mut ids: Vec<JobId> = leftovers.into_iter().flatten().collect();
        ids.sort();
        if !ids.is_empty() {
            warn!(count = ids.len(), "Jobs still running after shutdown grace period");
        }
        ids
    }
}

impl fmt::Debug for SchedulerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerContainer")
            .field("schedulers", &self.schedulers.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}
