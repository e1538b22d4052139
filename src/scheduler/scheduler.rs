//! Per-type scheduler: admission, priority queue, bounded worker set,
//! retries, expiration and shutdown.
//!
//! Every job type gets its own [`Scheduler`]. A scheduler owns the active
//! jobs of its type from admission until they reach a terminal state.
//!
//! # Features
//!
//! - Admission capped by `max_requests`; jobs over the cap fail at once
//! - Priority-then-FIFO dispatch to at most `max_active_jobs` workers
//! - Panic isolation: a panicking processor fails its job, not the worker
//! - Retry timers for transient failures, bounded by the job's retry limit
//! - A periodic sweep failing jobs that outlived their lifetime
//! - Graceful shutdown with a grace period for cooperative jobs
//!
//! # Job Flow
//!
//! ```text
//! schedule -> Queued -> Running -> Done | Failed | Canceled
//!                          |-> RetryWait -> Queued
//!                          |-> AsyncWait | RQueued | Ready (released)
//! ```
//!
//! A job leaves the active set as soon as its worker returns, even when the
//! job itself stays non-terminal (`Ready`, `AsyncWait`), so the worker bound
//! only counts jobs actually being processed.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::info::{describe, detailed, SchedulerInfo};
use super::listener::Listeners;
use super::queue::JobQueue;
use super::worker::{JobContext, JobFailure, JobProcessor, Outcome};
use crate::config::SchedulerConfig;
use crate::error::{IllegalStateTransition, SchedulerError, SrmError};
use crate::job::{Job, JobId, JobType, State, Transition, EXPIRED_DESCRIPTION};
use crate::metrics::{MetricsCollector, SchedulerGauges};
use crate::storage::JobStorage;

/// History description of jobs rejected by the `max_requests` cap.
pub const SITE_BUSY_DESCRIPTION: &str = "Site busy: too many queued requests.";

/// Cancel reason given to running jobs on shutdown.
pub const SHUTDOWN_DESCRIPTION: &str = "SRM is shutting down.";

type PanicPayload = Box<dyn Any + Send>;

/// Bookkeeping of one scheduler, guarded by its mutex.
#[derive(Debug)]
struct SchedulerState {
    /// Whether new jobs are admitted.
    running: bool,
    /// Upper bound on jobs held by workers at once.
    max_active_jobs: usize,
    /// Upper bound on tracked jobs, queued or not.
    max_requests: usize,
    /// Non-terminal jobs owned by this scheduler.
    jobs: HashMap<JobId, Arc<Job>>,
    /// Tracked ids grouped by their current state.
    by_state: HashMap<State, HashSet<JobId>>,
    /// Jobs waiting for a worker.
    queue: JobQueue,
    /// Jobs held by workers.
    active: HashSet<JobId>,
}

impl SchedulerState {
    /// Starts tracking a job under its current state.
    fn track(&mut self, job: &Arc<Job>) {
        if self.jobs.insert(job.id(), job.clone()).is_none() {
            self.by_state.entry(job.state()).or_default().insert(job.id());
        }
    }

    /// Forgets a job that reached a terminal state.
    fn untrack(&mut self, id: JobId) {
        self.jobs.remove(&id);
        self.queue.remove(id);
        self.active.remove(&id);
        for ids in self.by_state.values_mut() {
            ids.remove(&id);
        }
    }

    fn gauges(&self) -> SchedulerGauges {
        SchedulerGauges {
            queued: self.queue.len(),
            running: self.active.len(),
            max_active_jobs: self.max_active_jobs,
        }
    }
}

/// Result of an admission attempt, applied once the lock is released.
enum Admission {
    Queued(Transition),
    Rejected(Transition),
}

/// Scheduler for one job type.
///
/// All bookkeeping (tracked jobs, per-state sets, the wait queue and the
/// active set) lives under one mutex, which is never held across an await.
/// Job transitions are applied while holding it, so the job's lock is always
/// taken after the scheduler's. Persistence, metrics and listener
/// notification happen after the lock is released.
pub struct Scheduler {
    /// Stamped on every job this scheduler admits.
    id: String,
    job_type: JobType,
    /// Start time, stamped next to `id`.
    timestamp: i64,
    config: SchedulerConfig,
    /// Does the actual work of a job.
    processor: Arc<dyn JobProcessor>,
    storage: Arc<dyn JobStorage>,
    /// Notified after every transition has been saved.
    listeners: Listeners,
    state: Mutex<SchedulerState>,
    /// Signalled whenever a worker returns; shutdown waits on it.
    idle: Notify,
    /// Stops the background loop and pending retry timers.
    shutdown_tx: broadcast::Sender<()>,
    /// The background wake-up and expiration loop.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: MetricsCollector,
    /// Handed to spawned workers so they outlive the caller's borrow.
    this: Weak<Scheduler>,
}

impl Scheduler {
    /// Creates a stopped scheduler. Call [`Scheduler::start`] before
    /// scheduling jobs.
    ///
    /// # Arguments
    ///
    /// * `job_type` - The only job type this scheduler accepts
    /// * `config` - Worker bound, admission cap, retry and expiry settings
    /// * `processor` - Runs each dispatched job
    /// * `storage` - Where every transition is persisted
    /// * `listeners` - Told about every transition after it is saved
    pub fn new(
        job_type: JobType,
        config: SchedulerConfig,
        processor: Arc<dyn JobProcessor>,
        storage: Arc<dyn JobStorage>,
        listeners: Listeners,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new_cyclic(|this| Self {
            id: job_type.as_str().to_string(),
            job_type,
            timestamp: Utc::now().timestamp_millis(),
            state: Mutex::new(SchedulerState {
                running: false,
                max_active_jobs: config.max_active_jobs,
                max_requests: config.max_requests,
                jobs: HashMap::new(),
                by_state: HashMap::new(),
                queue: JobQueue::new(),
                active: HashSet::new(),
            }),
            config,
            processor,
            storage,
            listeners,
            idle: Notify::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            metrics: MetricsCollector::new(),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scheduler id, the lowercase job type name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The job type this scheduler accepts.
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Start time in milliseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Configuration the scheduler was created with. The worker bound may
    /// have changed since; see [`Scheduler::max_active_jobs`].
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether the scheduler admits new jobs.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Starts admitting jobs and spawns the wake-up and expiration loop.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| SchedulerError::NotRunning(self.id.clone()))?;
        {
            let mut st = self.lock();
            if st.running {
                return Err(SchedulerError::AlreadyRunning(self.id.clone()));
            }
            st.running = true;
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let wake_interval = self.config.queue_wake_interval;
        let expiration_interval = self.config.expiration_interval;
        let handle = tokio::spawn(async move {
            let mut wake = tokio::time::interval(wake_interval);
            wake.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut expiration = tokio::time::interval(expiration_interval);
            expiration.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = wake.tick() => this.dispatch(),
                    _ = expiration.tick() => {
                        this.expire_jobs().await;
                    }
                }
            }
            debug!(scheduler = %this.id, "Scheduler loop stopped");
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        info!(
            scheduler = %self.id,
            max_active_jobs = self.config.max_active_jobs,
            max_requests = self.config.max_requests,
            "Scheduler started"
        );
        Ok(())
    }

    /// Rejects jobs of another type.
    fn check_type(&self, job: &Job) -> Result<(), SchedulerError> {
        if job.job_type() != self.job_type {
            return Err(SchedulerError::WrongJobType {
                scheduler: self.id.clone(),
                job_type: job.job_type(),
            });
        }
        Ok(())
    }

    /// Applies a transition and keeps the per-state sets in step.
    fn apply(
        &self,
        st: &mut SchedulerState,
        job: &Arc<Job>,
        to: State,
        description: impl Into<String>,
    ) -> Result<Transition, IllegalStateTransition> {
        let transition = job.transition(to, description)?;
        let id = job.id();
        if let Some(ids) = st.by_state.get_mut(&transition.from) {
            ids.remove(&id);
        }
        if to.is_final() {
            st.untrack(id);
        } else {
            st.by_state.entry(to).or_default().insert(id);
        }
        Ok(transition)
    }

    /// Saves the job, records the transition and tells the listeners.
    async fn after_transition(&self, job: &Arc<Job>, transition: Transition) {
        job.save(self.storage.as_ref(), false).await;
        self.metrics.record_transition(self.job_type, transition.to);
        self.listeners.notify(job, transition);
    }

    /// Admits a job: `Pending`, `RetryWait` or `Restored` to `Queued`.
    ///
    /// A scheduler already tracking `max_requests` jobs moves new ones
    /// straight to `Failed`.
    pub async fn schedule(&self, job: Arc<Job>) -> Result<(), SrmError> {
        self.check_type(&job)?;
        if !self.is_running() {
            return Err(SchedulerError::NotRunning(self.id.clone()).into());
        }
        let from = job.state();
        if !matches!(from, State::Pending | State::RetryWait | State::Restored) {
            return Err(IllegalStateTransition {
                job_id: job.id(),
                from,
                to: State::Queued,
            }
            .into());
        }

        job.set_scheduler(&self.id, self.timestamp);
        job.save(self.storage.as_ref(), true).await;

        let admission = {
            let mut st = self.lock();
            if !st.running {
                return Err(SchedulerError::NotRunning(self.id.clone()).into());
            }
            if !st.jobs.contains_key(&job.id()) && st.jobs.len() >= st.max_requests {
                Admission::Rejected(job.transition(State::Failed, SITE_BUSY_DESCRIPTION)?)
            } else {
                st.track(&job);
                let transition = self.apply(&mut st, &job, State::Queued, "Request enqueued.")?;
                st.queue.push(job.id(), job.priority());
                self.metrics.update_scheduler(self.job_type, st.gauges());
                Admission::Queued(transition)
            }
        };

        match admission {
            Admission::Queued(transition) => {
                debug!(scheduler = %self.id, job_id = %job.id(), priority = job.priority(), "Job queued");
                self.after_transition(&job, transition).await;
                self.dispatch();
            }
            Admission::Rejected(transition) => {
                warn!(scheduler = %self.id, job_id = %job.id(), "Rejected job: too many requests");
                self.after_transition(&job, transition).await;
            }
        }
        Ok(())
    }

    /// Re-admits a job rebuilt from storage after a restart.
    ///
    /// The job passes through `Restored`. Expired jobs fail; jobs that held a
    /// transfer URL become `Ready` again; waiting containers return to
    /// `AsyncWait`; everything else is queued and processed from the start.
    pub async fn restore(&self, job: Arc<Job>) -> Result<(), SrmError> {
        self.check_type(&job)?;
        let saved = job.state();
        if saved.is_final() {
            return Ok(());
        }
        let now = Utc::now();

        let transitions = {
            let mut st = self.lock();
            if !st.running {
                return Err(SchedulerError::NotRunning(self.id.clone()).into());
            }
            if st.jobs.contains_key(&job.id()) {
                return Ok(());
            }
            job.set_scheduler(&self.id, self.timestamp);
            st.track(&job);

            let mut applied = Vec::with_capacity(2);
            if saved != State::Restored {
                applied.push(self.apply(&mut st, &job, State::Restored, "Restored after restart.")?);
            }
            let (to, description) = if job.is_expired_at(now) {
                (State::Failed, EXPIRED_DESCRIPTION)
            } else {
                match saved {
                    State::RQueued | State::Ready => (State::Ready, "Transfer URL kept after restart."),
                    State::AsyncWait => (State::AsyncWait, "Waiting for file requests after restart."),
                    _ => (State::Queued, "Request enqueued after restart."),
                }
            };
            applied.push(self.apply(&mut st, &job, to, description)?);
            if to == State::Queued {
                st.queue.push(job.id(), job.priority());
            }
            applied
        };

        debug!(scheduler = %self.id, job_id = %job.id(), saved = %saved, state = %job.state(), "Job restored");
        for transition in transitions {
            self.after_transition(&job, transition).await;
        }
        self.dispatch();
        Ok(())
    }

    /// Promotes queued jobs to `Running` while fewer than `max_active_jobs`
    /// are held by workers, and hands each to a worker task.
    pub fn dispatch(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let started = {
            let mut st = self.lock();
            if !st.running {
                return;
            }
            let mut started = Vec::new();
            while st.active.len() < st.max_active_jobs {
                let Some(id) = st.queue.pop() else {
                    break;
                };
                let Some(job) = st.jobs.get(&id).cloned() else {
                    continue;
                };
                match self.apply(&mut st, &job, State::Running, "Processing request.") {
                    Ok(transition) => {
                        st.active.insert(id);
                        started.push((job, transition));
                    }
                    Err(e) => warn!(scheduler = %self.id, error = %e, "Dropping job from queue"),
                }
            }
            self.metrics.update_scheduler(self.job_type, st.gauges());
            started
        };

        for (job, transition) in started {
            tokio::spawn(this.clone().run_job(job, transition));
        }
    }

    /// Worker body: runs the processor, catching panics, then applies the
    /// resulting transition and frees the worker slot.
    async fn run_job(self: Arc<Self>, job: Arc<Job>, started: Transition) {
        self.after_transition(&job, started).await;

        let clock = Instant::now();
        let ctx = JobContext::new(job.clone());
        let result = AssertUnwindSafe(self.processor.process(&ctx))
            .catch_unwind()
            .await;
        let (to, description) = self.resolve(&job, result);
        let elapsed = clock.elapsed();

        let (transitions, retry) = {
            let mut st = self.lock();
            st.active.remove(&job.id());
            let steps: &[State] = if to == State::Ready {
                &[State::RQueued, State::Ready]
            } else {
                std::slice::from_ref(&to)
            };
            let mut applied = Vec::with_capacity(steps.len());
            for step in steps {
                match self.apply(&mut st, &job, *step, description.as_str()) {
                    Ok(transition) => applied.push(transition),
                    Err(e) => {
                        error!(scheduler = %self.id, job_id = %job.id(), error = %e, "Could not apply worker result");
                        if let Ok(transition) =
                            self.apply(&mut st, &job, State::Failed, format!("Internal error: {}", e))
                        {
                            applied.push(transition);
                        }
                        break;
                    }
                }
            }
            self.metrics.update_scheduler(self.job_type, st.gauges());
            let retry = applied.last().map(|t| t.to) == Some(State::RetryWait);
            (applied, retry)
        };

        self.metrics
            .record_job_processed(self.job_type, job.state(), elapsed);
        debug!(
            scheduler = %self.id,
            job_id = %job.id(),
            state = %job.state(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Worker finished"
        );

        for transition in transitions {
            self.after_transition(&job, transition).await;
        }
        if retry {
            self.schedule_retry(job);
        }
        self.dispatch();
        self.idle.notify_waiters();
    }

    /// Maps a worker result to the state the job moves to.
    fn resolve(
        &self,
        job: &Job,
        result: Result<Result<Outcome, JobFailure>, PanicPayload>,
    ) -> (State, String) {
        let result = match result {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(scheduler = %self.id, job_id = %job.id(), panic = %message, "Job processor panicked");
                return (State::Failed, format!("Internal error: {}", message));
            }
        };

        let token = job.cancel_token();
        if token.is_cancelled() && !matches!(result, Ok(Outcome::Done(_))) {
            if token.is_expired() {
                return (State::Failed, EXPIRED_DESCRIPTION.to_string());
            }
            return (
                State::Canceled,
                token.reason().unwrap_or_else(|| "Canceled.".to_string()),
            );
        }

        match result {
            Ok(Outcome::Done(d)) => (State::Done, d),
            Ok(Outcome::Ready(d)) => (State::Ready, d),
            Ok(Outcome::AsyncWait(d)) => (State::AsyncWait, d),
            Err(JobFailure::Fatal(d)) => (State::Failed, d),
            Err(JobFailure::Canceled(d)) => (State::Canceled, d),
            Err(JobFailure::Transient(d)) => {
                let retries = job.number_of_retries();
                if retries < job.max_number_of_retries() {
                    (State::RetryWait, d)
                } else {
                    (State::Failed, format!("{} (giving up after {} retries)", d, retries))
                }
            }
        }
    }

    /// Re-admits a job in `RetryWait` once `retry_timeout` has passed.
    fn schedule_retry(&self, job: Arc<Job>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let delay = self.config.retry_timeout;
        let mut shutdown = self.shutdown_tx.subscribe();
        debug!(scheduler = %self.id, job_id = %job.id(), delay_ms = delay.as_millis() as u64, "Retry scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
            this.requeue(&job).await;
        });
    }

    /// Moves a waiting job back to `Queued` unless it finished meanwhile.
    async fn requeue(&self, job: &Arc<Job>) {
        let transition = {
            let mut st = self.lock();
            if !st.running || job.state() != State::RetryWait || !st.jobs.contains_key(&job.id()) {
                return;
            }
            match self.apply(&mut st, job, State::Queued, "Retrying request.") {
                Ok(transition) => {
                    st.queue.push(job.id(), job.priority());
                    transition
                }
                Err(e) => {
                    warn!(scheduler = %self.id, error = %e, "Could not requeue job");
                    return;
                }
            }
        };
        self.after_transition(job, transition).await;
        self.dispatch();
    }

    /// Requests cancellation of a tracked job.
    ///
    /// A job held by a worker only receives the cancel signal and becomes
    /// `Canceled` once the worker returns; any other job is canceled at once.
    pub async fn cancel(&self, id: JobId, reason: &str) -> Result<(), SrmError> {
        let (job, transition) = {
            let mut st = self.lock();
            let job = st.jobs.get(&id).cloned().ok_or(SrmError::UnknownJob(id))?;
            if st.active.contains(&id) {
                job.cancel_token().cancel(reason);
                debug!(scheduler = %self.id, job_id = %id, "Cancel signalled to worker");
                return Ok(());
            }
            st.queue.remove(id);
            let transition = self.apply(&mut st, &job, State::Canceled, reason)?;
            self.metrics.update_scheduler(self.job_type, st.gauges());
            (job, transition)
        };
        self.after_transition(&job, transition).await;
        Ok(())
    }

    /// Applies a transition on behalf of another component, e.g. a request
    /// completing from its children or a client finishing an upload.
    pub async fn transition(
        &self,
        job: &Arc<Job>,
        to: State,
        description: &str,
    ) -> Result<Transition, SrmError> {
        let id = job.id();
        let transition = {
            let mut st = self.lock();
            if !st.jobs.contains_key(&id) {
                return Err(SchedulerError::NotOwned {
                    job_id: id,
                    scheduler: self.id.clone(),
                }
                .into());
            }
            if st.active.contains(&id) {
                return Err(SchedulerError::Busy(id).into());
            }
            let transition = self.apply(&mut st, job, to, description)?;
            if transition.from == State::Queued {
                st.queue.remove(id);
            }
            if to == State::Queued {
                st.queue.push(id, job.priority());
            }
            transition
        };
        self.after_transition(job, transition).await;
        if to == State::Queued {
            self.dispatch();
        }
        Ok(transition)
    }

    /// Fails every owned job whose lifetime has passed, as listed by storage.
    /// Jobs held by workers get an expiry signal instead. Returns the number
    /// of jobs affected.
    pub async fn expire_jobs(&self) -> usize {
        let records = match self.storage.get_active_jobs().await {
            Ok(records) => records,
            Err(e) => {
                self.metrics.record_storage_failure();
                error!(scheduler = %self.id, error = %e, "Expiration sweep could not read active jobs");
                return 0;
            }
        };
        let now = Utc::now();

        let (expired, signalled) = {
            let mut st = self.lock();
            let mut expired = Vec::new();
            let mut signalled = 0;
            for record in records
                .iter()
                .filter(|r| r.job_type == self.job_type && r.deadline() <= now)
            {
                let Some(job) = st.jobs.get(&record.id).cloned() else {
                    continue;
                };
                if st.active.contains(&record.id) {
                    job.cancel_token().expire();
                    signalled += 1;
                    continue;
                }
                st.queue.remove(record.id);
                match self.apply(&mut st, &job, State::Failed, EXPIRED_DESCRIPTION) {
                    Ok(transition) => expired.push((job, transition)),
                    Err(e) => warn!(scheduler = %self.id, error = %e, "Could not expire job"),
                }
            }
            if !expired.is_empty() {
                self.metrics.update_scheduler(self.job_type, st.gauges());
            }
            (expired, signalled)
        };

        if !expired.is_empty() || signalled > 0 {
            info!(
                scheduler = %self.id,
                expired = expired.len(),
                signalled,
                "Expired jobs past their lifetime"
            );
        }
        let count = expired.len() + signalled;
        for (job, transition) in expired {
            self.after_transition(&job, transition).await;
        }
        self.dispatch();
        count
    }

    /// Changes the worker bound. Running jobs are never interrupted.
    pub fn set_max_active_jobs(&self, max: usize) {
        {
            let mut st = self.lock();
            st.max_active_jobs = max;
            self.metrics.update_scheduler(self.job_type, st.gauges());
        }
        info!(scheduler = %self.id, max_active_jobs = max, "Max active jobs changed");
        self.dispatch();
    }

    /// Current worker bound.
    pub fn max_active_jobs(&self) -> usize {
        self.lock().max_active_jobs
    }

    /// (active + queued) / max_active_jobs.
    pub fn load(&self) -> f64 {
        self.info().load()
    }

    /// A job tracked by this scheduler.
    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Tracked jobs ordered by id.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<_> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id());
        jobs
    }

    /// Ids waiting for a worker, in dispatch order.
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.lock().queue.ids()
    }

    /// Ids held by workers, sorted.
    pub fn active_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.lock().active.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Point-in-time summary of the scheduler.
    pub fn info(&self) -> SchedulerInfo {
        let st = self.lock();
        SchedulerInfo {
            id: self.id.clone(),
            job_type: self.job_type,
            running: st.running,
            max_active_jobs: st.max_active_jobs,
            max_requests: st.max_requests,
            active: st.active.len(),
            queued: st.queue.len(),
            states: st
                .by_state
                .iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(state, ids)| (*state, ids.len()))
                .collect(),
        }
    }

    /// Summary plus one line per tracked job.
    pub fn detailed_info(&self) -> String {
        let queue = self.queued_ids();
        let jobs: Vec<(JobId, String)> = self
            .jobs()
            .iter()
            .map(|job| (job.id(), describe(job)))
            .collect();
        detailed(&self.info(), &jobs, &queue)
    }

    /// Stops admitting jobs, signals cancellation to running jobs and waits
    /// up to `grace` for them. Returns the ids still held by workers.
    pub async fn shutdown(&self, grace: Duration) -> Vec<JobId> {
        let active: Vec<Arc<Job>> = {
            let mut st = self.lock();
            st.running = false;
            st.active
                .iter()
                .filter_map(|id| st.jobs.get(id).cloned())
                .collect()
        };
        info!(
            scheduler = %self.id,
            active = active.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down scheduler"
        );
        for job in &active {
            job.cancel_token().cancel(SHUTDOWN_DESCRIPTION);
        }
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            let drained = self.lock().active.is_empty();
            if drained {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let leftovers = self.active_ids();
        for id in &leftovers {
            warn!(scheduler = %self.id, job_id = %id, "Job did not terminate within the shutdown grace period");
        }
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        leftovers
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::job::kind::BringOnlineFileRequest;
    use crate::job::{JobKind, SrmUser, Surl};
    use crate::storage::InMemoryJobStorage;

    struct Scripted {
        calls: AtomicUsize,
        results: Vec<Result<Outcome, JobFailure>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<Outcome, JobFailure>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                results,
            })
        }
    }

    #[async_trait]
    impl JobProcessor for Scripted {
        async fn process(&self, _ctx: &JobContext) -> Result<Outcome, JobFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = call.min(self.results.len() - 1);
            self.results[idx].clone()
        }
    }

    struct Panics;

    #[async_trait]
    impl JobProcessor for Panics {
        async fn process(&self, _ctx: &JobContext) -> Result<Outcome, JobFailure> {
            panic!("boom")
        }
    }

    fn plain_job(id: i64) -> Job {
        Job::new(
            JobId(id),
            SrmUser::new("carol"),
            JobKind::BringOnlineFile(BringOnlineFileRequest {
                surl: Surl::parse(&format!("srm://se/data/{}", id)).unwrap(),
                pin_id: None,
            }),
            Duration::from_secs(60),
        )
    }

    fn job(id: i64) -> Arc<Job> {
        Arc::new(plain_job(id))
    }

    fn scheduler(processor: Arc<dyn JobProcessor>, config: SchedulerConfig) -> Arc<Scheduler> {
        Scheduler::new(
            JobType::BringOnline,
            config,
            processor,
            Arc::new(InMemoryJobStorage::new()),
            Listeners::new(),
        )
    }

    async fn wait_for(job: &Job, state: State) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while job.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "job {} stuck in {}", job.id(), job.state());
    }

    #[tokio::test]
    async fn test_not_running_rejects() {
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Done("ok".into()))]), SchedulerConfig::default());
        let err = s.schedule(job(1)).await.unwrap_err();
        assert!(matches!(err, SrmError::Scheduler(SchedulerError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let s = Scheduler::new(
            JobType::Get,
            SchedulerConfig::default(),
            Scripted::new(vec![Ok(Outcome::Done("ok".into()))]),
            Arc::new(InMemoryJobStorage::new()),
            Listeners::new(),
        );
        s.start().unwrap();
        let err = s.schedule(job(1)).await.unwrap_err();
        assert!(matches!(
            err,
            SrmError::Scheduler(SchedulerError::WrongJobType { .. })
        ));
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_schedule_to_done() {
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Done("pinned".into()))]), SchedulerConfig::default());
        s.start().unwrap();
        assert!(matches!(s.start(), Err(SchedulerError::AlreadyRunning(_))));

        let j = job(1);
        s.schedule(j.clone()).await.unwrap();
        wait_for(&j, State::Done).await;

        let states: Vec<State> = j.history().iter().map(|h| h.to).collect();
        assert_eq!(states, vec![State::Queued, State::Running, State::Done]);
        assert_eq!(j.scheduler_id().as_deref(), Some("bring_online"));
        assert!(s.get(JobId(1)).is_none());
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_schedule_from_illegal_state() {
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Done("ok".into()))]), SchedulerConfig::default());
        s.start().unwrap();
        let j = job(1);
        j.transition(State::Queued, "elsewhere").unwrap();
        let err = s.schedule(j.clone()).await.unwrap_err();
        assert!(matches!(err, SrmError::IllegalState(_)));
        assert_eq!(j.state(), State::Queued);
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_ready_goes_through_rqueued() {
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Ready("turl".into()))]), SchedulerConfig::default());
        s.start().unwrap();
        let j = job(1);
        s.schedule(j.clone()).await.unwrap();
        wait_for(&j, State::Ready).await;
        let states: Vec<State> = j.history().iter().map(|h| h.to).collect();
        assert_eq!(
            states,
            vec![State::Queued, State::Running, State::RQueued, State::Ready]
        );
        // Ready jobs stay owned until the client finishes them.
        assert!(s.get(JobId(1)).is_some());
        s.transition(&j, State::Done, "released").await.unwrap();
        assert!(s.get(JobId(1)).is_none());
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_panic_becomes_failed() {
        let s = scheduler(Arc::new(Panics), SchedulerConfig::default());
        s.start().unwrap();
        let j = job(1);
        s.schedule(j.clone()).await.unwrap();
        wait_for(&j, State::Failed).await;
        assert_eq!(j.last_description().as_deref(), Some("Internal error: boom"));
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_transient_retries_then_fails() {
        let config = SchedulerConfig::default().with_retry_timeout(Duration::from_millis(10));
        let s = scheduler(Scripted::new(vec![Err(JobFailure::Transient("pool down".into()))]), config);
        s.start().unwrap();
        let j = Arc::new(plain_job(1).with_max_retries(2));
        s.schedule(j.clone()).await.unwrap();
        wait_for(&j, State::Failed).await;
        assert_eq!(j.number_of_retries(), 2);
        assert!(j
            .last_description()
            .unwrap()
            .contains("giving up after 2 retries"));
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_max_requests_fails_new_jobs() {
        let config = SchedulerConfig::default()
            .with_max_active_jobs(1)
            .with_max_requests(1);
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Ready("turl".into()))]), config);
        s.start().unwrap();

        let first = job(1);
        s.schedule(first.clone()).await.unwrap();
        wait_for(&first, State::Ready).await;

        let second = job(2);
        s.schedule(second.clone()).await.unwrap();
        assert_eq!(second.state(), State::Failed);
        assert_eq!(second.last_description().as_deref(), Some(SITE_BUSY_DESCRIPTION));
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let config = SchedulerConfig::default().with_max_active_jobs(1);
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Ready("turl".into()))]), config);
        s.start().unwrap();
        s.set_max_active_jobs(0);

        let j = job(1);
        s.schedule(j.clone()).await.unwrap();
        assert_eq!(j.state(), State::Queued);
        assert_eq!(s.load(), f64::INFINITY);

        s.cancel(JobId(1), "by admin").await.unwrap();
        assert_eq!(j.state(), State::Canceled);
        assert!(s.queued_ids().is_empty());
        assert!(matches!(
            s.cancel(JobId(1), "again").await,
            Err(SrmError::UnknownJob(_))
        ));
        s.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_info_counts_states() {
        let s = scheduler(Scripted::new(vec![Ok(Outcome::Done("ok".into()))]), SchedulerConfig::default());
        s.start().unwrap();
        s.set_max_active_jobs(0);
        for id in 1..=3 {
            s.schedule(job(id)).await.unwrap();
        }
        let info = s.info();
        assert_eq!(info.queued, 3);
        assert_eq!(info.states.get(&State::Queued), Some(&3));
        assert!(s.detailed_info().contains("queue: 1 2 3"));

        s.set_max_active_jobs(3);
        for id in 1..=3 {
            let j = s.get(JobId(id));
            if let Some(j) = j {
                wait_for(&j, State::Done).await;
            }
        }
        s.shutdown(Duration::from_millis(10)).await;
    }
}
