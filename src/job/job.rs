//! The live job: immutable identity plus a locked, mutable core.
//!
//! A [`Job`] is shared as `Arc<Job>` between its scheduler, the request
//! manager and the live registry. Identity fields (id, type, owner,
//! priority, lifetime) never change after creation and are read without
//! locking. Everything that changes over the job's life sits in one mutex:
//!
//! - The current state and the append-only history
//! - The owning scheduler's id and start timestamp
//! - The retry counter
//! - The payload ([`JobKind`]), updated as processing produces results
//!
//! The mutex is held only for the duration of a read or a transition and
//! never across an await.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, trace};

use super::cancel::CancelToken;
use super::history::JobHistory;
use super::kind::JobKind;
use super::state::State;
use super::types::{JobId, JobType, SrmUser};
use crate::error::IllegalStateTransition;
use crate::metrics::MetricsCollector;
use crate::storage::{JobRecord, JobStorage};

/// Default number of retries after transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A state change that has been applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// The job that changed.
    pub job_id: JobId,
    /// State before the change.
    pub from: State,
    /// State after the change.
    pub to: State,
}

/// Mutable part of a job.
#[derive(Debug)]
struct JobCore {
    state: State,
    /// One entry per applied transition, oldest first.
    history: Vec<JobHistory>,
    last_state_transition_time: DateTime<Utc>,
    /// Scheduler that admitted the job, if any.
    scheduler_id: Option<String>,
    /// Start time of that scheduler, to tell restarts apart.
    scheduler_timestamp: i64,
    /// Transient failures retried so far.
    number_of_retries: u32,
    /// Set once a terminal snapshot has been written.
    saved_in_final_state: bool,
    kind: JobKind,
}

/// A schedulable unit of work.
///
/// State changes go through [`Job::transition`], which enforces the state
/// table and appends one history entry per change. Callers that own the job
/// (its scheduler, or the request manager for unscheduled containers) are
/// responsible for persisting and announcing the change afterwards.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    job_type: JobType,
    /// Container request of a file request.
    parent_id: Option<JobId>,
    user: SrmUser,
    /// Larger values are dispatched first.
    priority: u32,
    creation_time: DateTime<Utc>,
    /// How long the job may stay active after creation.
    lifetime: Duration,
    max_number_of_retries: u32,
    core: Mutex<JobCore>,
    /// Cooperative cancel signal for the worker holding the job.
    cancel: CancelToken,
}

impl Job {
    /// Creates a new job in `Pending`.
    pub fn new(id: JobId, user: SrmUser, kind: JobKind, lifetime: Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type: kind.job_type(),
            parent_id: None,
            user,
            priority: 0,
            creation_time: now,
            lifetime,
            max_number_of_retries: DEFAULT_MAX_RETRIES,
            core: Mutex::new(JobCore {
                state: State::Pending,
                history: Vec::new(),
                last_state_transition_time: now,
                scheduler_id: None,
                scheduler_timestamp: 0,
                number_of_retries: 0,
                saved_in_final_state: false,
                kind,
            }),
            cancel: CancelToken::new(),
        }
    }

    /// Sets the dispatch priority. Defaults to 0.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the job as a file request of `parent_id`.
    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets how many transient failures are retried. Defaults to
    /// [`DEFAULT_MAX_RETRIES`].
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_number_of_retries = max_retries;
        self
    }

    /// Rebuilds a live job from a stored snapshot, keeping its saved state.
    pub fn from_record(record: JobRecord) -> Self {
        let saved_in_final_state = record.state.is_final();
        Self {
            id: record.id,
            job_type: record.job_type,
            parent_id: record.parent_id,
            user: record.user,
            priority: record.priority,
            creation_time: record.creation_time,
            lifetime: Duration::from_millis(record.lifetime_ms),
            max_number_of_retries: record.max_number_of_retries,
            core: Mutex::new(JobCore {
                state: record.state,
                history: record.history,
                last_state_transition_time: record.last_state_transition_time,
                scheduler_id: record.scheduler_id,
                scheduler_timestamp: record.scheduler_timestamp,
                number_of_retries: record.number_of_retries,
                saved_in_final_state,
                kind: record.kind,
            }),
            cancel: CancelToken::new(),
        }
    }

    fn core(&self) -> MutexGuard<'_, JobCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Container request, for file requests.
    pub fn parent_id(&self) -> Option<JobId> {
        self.parent_id
    }

    /// The submitting user.
    pub fn user(&self) -> &SrmUser {
        &self.user
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Expiration deadline: creation time plus lifetime.
    pub fn deadline(&self) -> DateTime<Utc> {
        deadline(self.creation_time, self.lifetime)
    }

    /// Whether the deadline is at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline() <= now
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining_lifetime(&self) -> Duration {
        (self.deadline() - Utc::now()).to_std().unwrap_or_default()
    }

    pub fn max_number_of_retries(&self) -> u32 {
        self.max_number_of_retries
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.core().state
    }

    /// Whether the job reached `Done`, `Failed` or `Canceled`.
    pub fn is_final(&self) -> bool {
        self.state().is_final()
    }

    pub fn last_state_transition_time(&self) -> DateTime<Utc> {
        self.core().last_state_transition_time
    }

    /// Transient failures retried so far.
    pub fn number_of_retries(&self) -> u32 {
        self.core().number_of_retries
    }

    pub fn scheduler_id(&self) -> Option<String> {
        self.core().scheduler_id.clone()
    }

    pub fn scheduler_timestamp(&self) -> i64 {
        self.core().scheduler_timestamp
    }

    /// Records the scheduler instance that owns this job.
    pub fn set_scheduler(&self, scheduler_id: &str, timestamp: i64) {
        let mut core = self.core();
        core.scheduler_id = Some(scheduler_id.to_string());
        core.scheduler_timestamp = timestamp;
    }

    /// Copy of the payload.
    pub fn kind(&self) -> JobKind {
        self.core().kind.clone()
    }

    /// File request ids of a container; empty for anything else.
    pub fn children(&self) -> Vec<JobId> {
        self.core().kind.children().to_vec()
    }

    pub fn is_container(&self) -> bool {
        self.core().kind.is_container()
    }

    /// Whether this job is owned by a scheduler while active.
    pub fn is_scheduled(&self) -> bool {
        self.core().kind.is_scheduled()
    }

    /// One-line description of the payload.
    pub fn summary(&self) -> String {
        self.core().kind.summary()
    }

    /// Updates the payload, typically to record processing results.
    pub fn update_kind<F: FnOnce(&mut JobKind)>(&self, f: F) {
        f(&mut self.core().kind);
    }

    /// Copy of the full history, oldest first.
    pub fn history(&self) -> Vec<JobHistory> {
        self.core().history.clone()
    }

    pub fn last_history(&self) -> Option<JobHistory> {
        self.core().history.last().cloned()
    }

    /// Description of the most recent transition, if any.
    pub fn last_description(&self) -> Option<String> {
        self.core().history.last().map(|h| h.description.clone())
    }

    /// History rendered one entry per line.
    pub fn history_text(&self) -> String {
        self.core()
            .history
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Signal observed by the worker processing this job.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Applies a transition if the state table allows it.
    ///
    /// On success exactly one history entry is appended. On failure the job
    /// is left unchanged.
    pub fn transition(
        &self,
        to: State,
        description: impl Into<String>,
    ) -> Result<Transition, IllegalStateTransition> {
        let mut core = self.core();
        let from = core.state;
        if !from.can_transition_to(to) {
            return Err(IllegalStateTransition {
                job_id: self.id,
                from,
                to,
            });
        }

        let now = Utc::now();
        let seq = core.history.len() as u32;
        let description = description.into();
        trace!(job_id = %self.id, %from, %to, description = %description, "State transition");
        core.history.push(JobHistory {
            seq,
            transition_time: now,
            from,
            to,
            description,
        });
        core.state = to;
        core.last_state_transition_time = now;
        if to == State::RetryWait {
            core.number_of_retries += 1;
        }

        Ok(Transition {
            job_id: self.id,
            from,
            to,
        })
    }

    /// Snapshot for persistence.
    pub fn to_record(&self) -> JobRecord {
        let core = self.core();
        JobRecord {
            id: self.id,
            job_type: self.job_type,
            parent_id: self.parent_id,
            user: self.user.clone(),
            state: core.state,
            priority: self.priority,
            creation_time: self.creation_time,
            lifetime_ms: self.lifetime.as_millis() as u64,
            last_state_transition_time: core.last_state_transition_time,
            scheduler_id: core.scheduler_id.clone(),
            scheduler_timestamp: core.scheduler_timestamp,
            number_of_retries: core.number_of_retries,
            max_number_of_retries: self.max_number_of_retries,
            kind: core.kind.clone(),
            history: core.history.clone(),
        }
    }

    /// Whether the terminal snapshot has reached storage.
    pub fn is_saved_in_final_state(&self) -> bool {
        self.core().saved_in_final_state
    }

    /// Rewrites the stored snapshot after a payload change that came
    /// without a transition, such as a released pin on a finished file.
    pub async fn save_payload(&self, storage: &dyn JobStorage) -> bool {
        let record = self.to_record();
        match storage.save_job(&record, true).await {
            Ok(()) => true,
            Err(e) => {
                MetricsCollector::new().record_storage_failure();
                error!(job_id = %self.id, error = %e, "Failed to save job payload");
                false
            }
        }
    }

    /// Persists a snapshot of the job.
    ///
    /// Terminal snapshots are always written, once. Errors are logged and the
    /// in-memory state is kept as is. Returns whether a write happened.
    pub async fn save(&self, storage: &dyn JobStorage, force: bool) -> bool {
        if self.is_saved_in_final_state() {
            return false;
        }
        let record = self.to_record();
        let is_final = record.state.is_final();
        match storage.save_job(&record, force || is_final).await {
            Ok(()) => {
                if is_final {
                    self.core().saved_in_final_state = true;
                }
                true
            }
            Err(e) => {
                MetricsCollector::new().record_storage_failure();
                error!(job_id = %self.id, state = %record.state, error = %e, "Failed to save job");
                false
            }
        }
    }
}

pub(crate) fn deadline(creation_time: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| creation_time.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::kind::{BringOnlineFileRequest, JobKind};
    use crate::job::types::Surl;
    use crate::storage::InMemoryJobStorage;

    fn job(id: i64) -> Job {
        let kind = JobKind::BringOnlineFile(BringOnlineFileRequest {
            surl: Surl::parse("srm://se.example.org/data/f").unwrap(),
            pin_id: None,
        });
        Job::new(JobId(id), SrmUser::new("alice"), kind, Duration::from_secs(60))
    }

    #[test]
    fn test_transition_appends_history() {
        let job = job(1);
        let t = job.transition(State::Queued, "enqueued").unwrap();
        assert_eq!(t.from, State::Pending);
        assert_eq!(t.to, State::Queued);
        assert_eq!(job.state(), State::Queued);

        let history = job.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].seq, 0);
        assert_eq!(history[0].description, "enqueued");
    }

    #[test]
    fn test_illegal_transition_leaves_job_unchanged() {
        let job = job(2);
        let err = job.transition(State::Ready, "skip ahead").unwrap_err();
        assert_eq!(err.from, State::Pending);
        assert_eq!(err.to, State::Ready);
        assert_eq!(job.state(), State::Pending);
        assert!(job.history().is_empty());
    }

    #[test]
    fn test_terminal_is_final() {
        let job = job(3);
        job.transition(State::Canceled, "by user").unwrap();
        for to in State::ALL {
            assert!(job.transition(to, "again").is_err());
        }
        assert_eq!(job.history().len(), 1);
        assert_eq!(job.last_description().as_deref(), Some("by user"));
    }

    #[test]
    fn test_retry_wait_counts_retries() {
        let job = job(4);
        job.transition(State::Queued, "q").unwrap();
        job.transition(State::Running, "r").unwrap();
        job.transition(State::RetryWait, "transient").unwrap();
        assert_eq!(job.number_of_retries(), 1);
    }

    #[test]
    fn test_record_round_trip_keeps_state() {
        let job = job(5).with_priority(7).with_parent(JobId(1));
        job.set_scheduler("bring_online", 1234);
        job.transition(State::Queued, "q").unwrap();

        let restored = Job::from_record(job.to_record());
        assert_eq!(restored.id(), JobId(5));
        assert_eq!(restored.state(), State::Queued);
        assert_eq!(restored.priority(), 7);
        assert_eq!(restored.parent_id(), Some(JobId(1)));
        assert_eq!(restored.scheduler_id().as_deref(), Some("bring_online"));
        assert_eq!(restored.history(), job.history());
    }

    #[test]
    fn test_deadline() {
        let job = job(6);
        assert!(!job.is_expired_at(Utc::now()));
        assert!(job.is_expired_at(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[tokio::test]
    async fn test_saved_once_in_final_state() {
        let storage = InMemoryJobStorage::new();
        let job = job(7);
        assert!(job.save(&storage, true).await);
        job.transition(State::Done, "done").unwrap();
        assert!(job.save(&storage, false).await);
        assert!(job.is_saved_in_final_state());
        assert!(!job.save(&storage, true).await);
    }

    #[test]
    fn test_history_text() {
        let job = job(8);
        job.transition(State::Queued, "one").unwrap();
        job.transition(State::Running, "two").unwrap();
        let text = job.history_text();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("PENDING -> QUEUED: one"));
        assert!(text.contains("QUEUED -> RUNNING: two"));
    }
}
