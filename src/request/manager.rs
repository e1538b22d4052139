//! Client-facing request operations.
//!
//! The manager builds container requests and their file requests, submits
//! them to the schedulers, answers status queries and applies client
//! completions (`put_done`, `release_file`, `abort_file`). It also keeps each
//! container's state in step with its children through a state change
//! listener.

use std::sync::{Arc, Weak};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use super::container::{evaluate, CompletionPolicy};
use crate::backend::StorageBackend;
use crate::config::SrmConfig;
use crate::error::{IllegalStateTransition, SrmError};
use crate::job::kind::{
    BringOnlineFileRequest, CopyFileRequest, GetFileRequest, LsFileRequest, PutFileRequest,
    RequestSpec, ReserveSpaceRequest,
};
use crate::job::{
    Job, JobHistory, JobId, JobIdGenerator, JobKind, JobRegistry, JobType, SrmUser, State, Surl,
    Transition,
};
use crate::scheduler::{describe, RecoveryReport, SchedulerContainer, StateChangeListener};
use crate::storage::{JobRecord, JobStorage, StorageError};

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Lifetime; the scheduler's `default_lifetime` when unset.
    pub lifetime: Option<Duration>,
    pub priority: u32,
    pub description: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One file of a put request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutFileSpec {
    pub surl: Surl,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileStatus {
    pub id: JobId,
    pub state: State,
    pub description: Option<String>,
    pub kind: JobKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestStatus {
    pub id: JobId,
    pub job_type: JobType,
    pub state: State,
    pub description: Option<String>,
    pub history: Vec<JobHistory>,
    pub files: Vec<FileStatus>,
}

impl RequestStatus {
    fn from_record(record: JobRecord, files: Vec<FileStatus>) -> Self {
        Self {
            id: record.id,
            job_type: record.job_type,
            state: record.state,
            description: record.history.last().map(|h| h.description.clone()),
            history: record.history,
            files,
        }
    }
}

pub struct RequestManager {
    config: SrmConfig,
    container: Arc<SchedulerContainer>,
    registry: Arc<JobRegistry>,
    storage: Arc<dyn JobStorage>,
    backend: Arc<dyn StorageBackend>,
    ids: Arc<JobIdGenerator>,
}

impl RequestManager {
    /// Creates the manager and registers its completion listener.
    pub fn new(
        config: SrmConfig,
        container: Arc<SchedulerContainer>,
        registry: Arc<JobRegistry>,
        storage: Arc<dyn JobStorage>,
        backend: Arc<dyn StorageBackend>,
        ids: Arc<JobIdGenerator>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            container,
            registry,
            storage,
            backend,
            ids,
        });
        manager.container.add_listener(Arc::new(CompletionListener {
            manager: Arc::downgrade(&manager),
        }));
        manager
    }

    pub fn container(&self) -> &Arc<SchedulerContainer> {
        &self.container
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn submit_get(
        &self,
        user: SrmUser,
        surls: Vec<Surl>,
        protocols: Vec<String>,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        let kinds = surls
            .into_iter()
            .map(|surl| JobKind::GetFile(GetFileRequest::new(surl, protocols.clone())))
            .collect();
        self.submit_request(user, JobType::Get, kinds, options).await
    }

    pub async fn submit_put(
        &self,
        user: SrmUser,
        files: Vec<PutFileSpec>,
        overwrite: bool,
        protocols: Vec<String>,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        let kinds = files
            .into_iter()
            .map(|file| {
                JobKind::PutFile(PutFileRequest::new(
                    file.surl,
                    file.size,
                    overwrite,
                    protocols.clone(),
                ))
            })
            .collect();
        self.submit_request(user, JobType::Put, kinds, options).await
    }

    /// Copies `(source, destination)` pairs.
    pub async fn submit_copy(
        &self,
        user: SrmUser,
        pairs: Vec<(Surl, Surl)>,
        overwrite: bool,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        let kinds = pairs
            .into_iter()
            .map(|(source, destination)| {
                JobKind::CopyFile(CopyFileRequest {
                    source,
                    destination,
                    overwrite,
                })
            })
            .collect();
        self.submit_request(user, JobType::Copy, kinds, options).await
    }

    pub async fn submit_bring_online(
        &self,
        user: SrmUser,
        surls: Vec<Surl>,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        let kinds = surls
            .into_iter()
            .map(|surl| JobKind::BringOnlineFile(BringOnlineFileRequest { surl, pin_id: None }))
            .collect();
        self.submit_request(user, JobType::BringOnline, kinds, options)
            .await
    }

    pub async fn submit_ls(
        &self,
        user: SrmUser,
        surls: Vec<Surl>,
        depth: u32,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        let kinds = surls
            .into_iter()
            .map(|surl| {
                JobKind::LsFile(LsFileRequest {
                    surl,
                    depth,
                    entries: Vec::new(),
                })
            })
            .collect();
        self.submit_request(user, JobType::Ls, kinds, options).await
    }

    /// Reserves space. The reservation is a single scheduled job.
    pub async fn reserve_space(
        &self,
        user: SrmUser,
        size: u64,
        space_lifetime: Duration,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        if size == 0 {
            return Err(SrmError::InvalidRequest(
                "space reservation of zero bytes".to_string(),
            ));
        }
        let scheduler = self.config.scheduler(JobType::ReserveSpace);
        let kind = JobKind::ReserveSpace(ReserveSpaceRequest {
            size,
            space_lifetime,
            description: options.description,
            space_token: None,
        });
        let job = Arc::new(
            Job::new(
                self.ids.next_id(),
                user,
                kind,
                options.lifetime.unwrap_or(scheduler.default_lifetime),
            )
            .with_priority(options.priority)
            .with_max_retries(scheduler.max_retries),
        );
        let id = job.id();
        self.registry.insert(job.clone());
        info!(request_id = %id, size, "Space reservation submitted");
        if let Err(e) = self.container.schedule(job.clone()).await {
            self.fail(&job, &e.to_string()).await;
            return Err(e);
        }
        Ok(id)
    }

    async fn submit_request(
        &self,
        user: SrmUser,
        request_type: JobType,
        kinds: Vec<JobKind>,
        options: RequestOptions,
    ) -> Result<JobId, SrmError> {
        if kinds.is_empty() {
            return Err(SrmError::InvalidRequest(format!(
                "{} request contains no files",
                request_type
            )));
        }
        let scheduler = self.config.scheduler(request_type);
        let lifetime = options.lifetime.unwrap_or(scheduler.default_lifetime);
        let request_id = self.ids.next_id();

        let children: Vec<Arc<Job>> = kinds
            .into_iter()
            .map(|kind| {
                Arc::new(
                    Job::new(self.ids.next_id(), user.clone(), kind, lifetime)
                        .with_parent(request_id)
                        .with_priority(options.priority)
                        .with_max_retries(scheduler.max_retries),
                )
            })
            .collect();
        let spec = RequestSpec {
            request_type,
            children: children.iter().map(|child| child.id()).collect(),
            description: options.description,
        };
        let request = Arc::new(
            Job::new(request_id, user, JobKind::Request(spec), lifetime)
                .with_priority(options.priority)
                .with_max_retries(scheduler.max_retries),
        );

        self.registry.insert(request.clone());
        for child in &children {
            self.registry.insert(child.clone());
        }
        request.save(self.storage.as_ref(), true).await;
        for child in &children {
            child.save(self.storage.as_ref(), true).await;
        }
        info!(
            request_id = %request_id,
            request_type = %request_type,
            files = children.len(),
            user = %request.user(),
            "Request submitted"
        );

        if request.is_scheduled() {
            if let Err(e) = self.container.schedule(request.clone()).await {
                self.fail(&request, &e.to_string()).await;
                return Err(e);
            }
        } else {
            self.container
                .transition(&request, State::AsyncWait, "Waiting for file requests.")
                .await?;
            for child in children {
                if let Err(e) = self.container.schedule(child.clone()).await {
                    warn!(request_id = %request_id, job_id = %child.id(), error = %e, "Could not schedule file request");
                    self.fail(&child, &e.to_string()).await;
                }
            }
        }
        Ok(request_id)
    }

    async fn fail(&self, job: &Arc<Job>, description: &str) {
        if job.is_final() {
            return;
        }
        if let Err(e) = self
            .container
            .transition(job, State::Failed, description)
            .await
        {
            warn!(job_id = %job.id(), error = %e, "Could not fail job");
        }
    }

    /// Snapshot of a live job, or the stored one once it has been evicted.
    async fn record(&self, id: JobId) -> Result<JobRecord, SrmError> {
        if let Some(job) = self.registry.get(id) {
            return Ok(job.to_record());
        }
        match self.storage.get_job(id).await {
            Ok(record) => Ok(record),
            Err(StorageError::NotFound(_)) => Err(SrmError::UnknownJob(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// State and file states of a request.
    pub async fn status(&self, id: JobId) -> Result<RequestStatus, SrmError> {
        let record = self.record(id).await?;
        let mut files = Vec::with_capacity(record.kind.children().len());
        for child_id in record.kind.children() {
            let child = self.record(*child_id).await?;
            files.push(FileStatus {
                id: child.id,
                state: child.state,
                description: child.history.last().map(|h| h.description.clone()),
                kind: child.kind,
            });
        }
        Ok(RequestStatus::from_record(record, files))
    }

    /// One description line per live top-level request.
    pub fn list_requests(&self) -> Vec<String> {
        self.registry
            .top_level()
            .iter()
            .map(|job| describe(job))
            .collect()
    }

    async fn live(&self, id: JobId) -> Result<Arc<Job>, SrmError> {
        if let Some(job) = self.registry.get(id) {
            return Ok(job);
        }
        // Evicted jobs are terminal.
        let record = self.record(id).await?;
        Err(IllegalStateTransition {
            job_id: id,
            from: record.state,
            to: State::Canceled,
        }
        .into())
    }

    /// Cancels a request or a single file request.
    ///
    /// Canceling a container cascades to its active children once the
    /// container reaches `Canceled`.
    pub async fn cancel(&self, id: JobId, reason: &str) -> Result<(), SrmError> {
        let job = self.live(id).await?;
        if job.is_final() {
            return Err(IllegalStateTransition {
                job_id: id,
                from: job.state(),
                to: State::Canceled,
            }
            .into());
        }

        if job.is_container() {
            job.cancel_token().cancel(reason);
            match self.container.cancel(id, reason).await {
                Err(SrmError::UnknownJob(_)) => {
                    self.container
                        .transition(&job, State::Canceled, reason)
                        .await?;
                }
                other => other?,
            }
        } else {
            self.cancel_file(&job, reason).await?;
        }
        info!(request_id = %id, reason, "Cancel requested");
        Ok(())
    }

    async fn cancel_file(&self, job: &Arc<Job>, reason: &str) -> Result<(), SrmError> {
        if job.is_final() {
            return Ok(());
        }
        if job.state() == State::Ready {
            self.release_resources(job).await;
        }
        match self.container.cancel(job.id(), reason).await {
            Ok(()) => Ok(()),
            Err(SrmError::UnknownJob(_)) if job.is_final() => Ok(()),
            Err(SrmError::UnknownJob(_)) => self
                .container
                .transition(job, State::Canceled, reason)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// Gives back what a ready file request holds on the backend.
    ///
    /// The pin or upload handle is taken out of the job before the backend
    /// call, so releasing twice is a no-op.
    async fn release_resources(&self, job: &Job) {
        let mut held: Option<(Surl, Held)> = None;
        job.update_kind(|kind| match kind {
            JobKind::PutFile(put) => {
                held = put.file_id.take().map(|id| (put.surl.clone(), Held::Upload(id)));
            }
            JobKind::GetFile(get) => {
                held = get.pin_id.take().map(|id| (get.surl.clone(), Held::Pin(id)));
            }
            _ => {}
        });
        let Some((surl, held)) = held else {
            return;
        };
        let result = match &held {
            Held::Upload(file_id) => self.backend.abort_put(job.user(), &surl, file_id).await,
            Held::Pin(pin_id) => self.backend.unpin(job.user(), &surl, pin_id).await,
        };
        match result {
            Ok(()) => debug!(job_id = %job.id(), surl = %surl, "Released {:?}", held),
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "Could not release backend resources")
            }
        }
    }

    /// Cancels every live top-level request whose description line matches
    /// `pattern`.
    pub async fn cancel_matching(&self, pattern: &str, reason: &str) -> Result<Vec<JobId>, SrmError> {
        let regex = Regex::new(pattern)
            .map_err(|e| SrmError::InvalidRequest(format!("bad pattern '{}': {}", pattern, e)))?;
        let targets: Vec<Arc<Job>> = self
            .registry
            .top_level()
            .into_iter()
            .filter(|job| !job.is_final() && regex.is_match(&describe(job)))
            .collect();

        let mut canceled = Vec::with_capacity(targets.len());
        for job in targets {
            match self.cancel(job.id(), reason).await {
                Ok(()) => canceled.push(job.id()),
                Err(e) => debug!(request_id = %job.id(), error = %e, "Skipped matching request"),
            }
        }
        Ok(canceled)
    }

    /// The file request of `request_id` that operates on `surl`.
    ///
    /// Files of finished requests are no longer live, so they are rebuilt
    /// from storage.
    async fn file(&self, request_id: JobId, surl: &Surl) -> Result<Arc<Job>, SrmError> {
        let children = match self.registry.get(request_id) {
            Some(request) => request.children(),
            None => self.record(request_id).await?.kind.children().to_vec(),
        };
        for child_id in children {
            let child = match self.registry.get(child_id) {
                Some(child) => child,
                None => Arc::new(Job::from_record(self.record(child_id).await?)),
            };
            if file_surl(&child.kind()).as_ref() == Some(surl) {
                return Ok(child);
            }
        }
        Err(SrmError::InvalidRequest(format!(
            "{} is not part of request {}",
            surl, request_id
        )))
    }

    fn require_ready(job: &Job, to: State) -> Result<(), SrmError> {
        let state = job.state();
        if state != State::Ready {
            return Err(IllegalStateTransition {
                job_id: job.id(),
                from: state,
                to,
            }
            .into());
        }
        Ok(())
    }

    /// The client finished uploading a file of a put request.
    pub async fn put_done(&self, request_id: JobId, surl: &Surl) -> Result<(), SrmError> {
        let file = self.file(request_id, surl).await?;
        Self::require_ready(&file, State::Done)?;
        let JobKind::PutFile(put) = file.kind() else {
            return Err(SrmError::InvalidRequest(format!(
                "request {} is not a put request",
                request_id
            )));
        };
        let file_id = put
            .file_id
            .ok_or_else(|| SrmError::InvalidRequest(format!("no upload prepared for {}", surl)))?;
        self.backend.put_done(file.user(), surl, &file_id).await?;
        self.container
            .transition(&file, State::Done, "Upload completed.")
            .await?;
        Ok(())
    }

    /// The client is done with a file of a get or bring-online request.
    pub async fn release_file(&self, request_id: JobId, surl: &Surl) -> Result<(), SrmError> {
        let file = self.file(request_id, surl).await?;
        match file.kind() {
            JobKind::GetFile(get) => {
                Self::require_ready(&file, State::Done)?;
                if let Some(pin_id) = get.pin_id {
                    self.backend.unpin(file.user(), surl, &pin_id).await?;
                }
                self.container
                    .transition(&file, State::Done, "File released.")
                    .await?;
                Ok(())
            }
            JobKind::BringOnlineFile(bol) => {
                let pin_id = bol
                    .pin_id
                    .ok_or_else(|| SrmError::InvalidRequest(format!("{} is not pinned", surl)))?;
                self.backend.unpin(file.user(), surl, &pin_id).await?;
                file.update_kind(|kind| {
                    if let JobKind::BringOnlineFile(bol) = kind {
                        bol.pin_id = None;
                    }
                });
                file.save_payload(self.storage.as_ref()).await;
                Ok(())
            }
            _ => Err(SrmError::InvalidRequest(
                "release applies to get and bring-online requests".to_string(),
            )),
        }
    }

    /// Aborts one file of a request.
    pub async fn abort_file(&self, request_id: JobId, surl: &Surl) -> Result<(), SrmError> {
        let file = self.file(request_id, surl).await?;
        if file.is_final() {
            return Err(IllegalStateTransition {
                job_id: file.id(),
                from: file.state(),
                to: State::Canceled,
            }
            .into());
        }
        self.cancel_file(&file, "Aborted by client.").await
    }

    async fn child_state(&self, id: JobId) -> State {
        match self.record(id).await {
            Ok(record) => record.state,
            Err(e) => {
                warn!(job_id = %id, error = %e, "File request state unavailable");
                State::Failed
            }
        }
    }

    /// Moves a waiting container to the terminal state its children imply.
    /// Returns the new state, or `None` while children are still active.
    pub async fn update_status(&self, request: &Arc<Job>) -> Result<Option<State>, SrmError> {
        if request.state() != State::AsyncWait {
            return Ok(None);
        }
        let JobKind::Request(spec) = request.kind() else {
            return Ok(None);
        };

        let mut states = Vec::with_capacity(spec.children.len());
        for child in &spec.children {
            states.push(self.child_state(*child).await);
        }
        let policy = CompletionPolicy::for_request(spec.request_type);
        let Some((to, description)) =
            evaluate(policy, &states, request.cancel_token().is_cancelled())
        else {
            return Ok(None);
        };

        match self.container.transition(request, to, &description).await {
            Ok(_) => {
                info!(request_id = %request.id(), state = %to, description = %description, "Request finished");
                Ok(Some(to))
            }
            // Another update won the race.
            Err(SrmError::IllegalState(_)) if request.is_final() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Restores active jobs from storage and re-evaluates waiting containers.
    pub async fn recover(&self) -> Result<RecoveryReport, SrmError> {
        let report = self.container.restore(&self.registry).await?;
        for request in self.registry.top_level() {
            if request.is_container() {
                if let Err(e) = self.update_status(&request).await {
                    warn!(request_id = %request.id(), error = %e, "Could not update recovered request");
                }
            }
        }
        Ok(report)
    }

    /// Cancels what is left of a finished container and evicts it.
    async fn finish_request(&self, request: Arc<Job>) {
        let reason = format!("Request {} is {}.", request.id(), request.state());
        for child_id in request.children() {
            let Some(child) = self.registry.get(child_id) else {
                continue;
            };
            if let Err(e) = self.cancel_file(&child, &reason).await {
                debug!(job_id = %child_id, error = %e, "Could not cancel file request");
            }
            if child.is_final() {
                self.registry.remove(child_id);
            }
        }
        self.registry.remove(request.id());
        debug!(request_id = %request.id(), "Request evicted");
    }

    fn on_transition(self: &Arc<Self>, job: &Arc<Job>, transition: Transition) {
        let to = transition.to;
        match job.parent_id() {
            Some(parent_id) => {
                if !to.is_final() {
                    return;
                }
                if matches!(to, State::Failed | State::Canceled) && holds_resources(&job.kind()) {
                    let manager = self.clone();
                    let file = job.clone();
                    tokio::spawn(async move { manager.release_resources(&file).await });
                }
                match self.registry.get(parent_id) {
                    Some(parent) if !parent.is_final() => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.update_status(&parent).await {
                                warn!(request_id = %parent.id(), error = %e, "Could not update request");
                            }
                        });
                    }
                    _ => {
                        self.registry.remove(job.id());
                    }
                }
            }
            None if job.is_container() => {
                let manager = self.clone();
                let request = job.clone();
                if to == State::AsyncWait {
                    tokio::spawn(async move {
                        if let Err(e) = manager.update_status(&request).await {
                            warn!(request_id = %request.id(), error = %e, "Could not update request");
                        }
                    });
                } else if to.is_final() {
                    tokio::spawn(async move { manager.finish_request(request).await });
                }
            }
            None => {
                if to.is_final() {
                    self.registry.remove(job.id());
                }
            }
        }
    }
}

/// Backend handle a ready file request keeps until it finishes.
#[derive(Debug)]
enum Held {
    Pin(String),
    Upload(String),
}

fn holds_resources(kind: &JobKind) -> bool {
    match kind {
        JobKind::GetFile(get) => get.pin_id.is_some(),
        JobKind::PutFile(put) => put.file_id.is_some(),
        _ => false,
    }
}

/// SURL a file request operates on.
fn file_surl(kind: &JobKind) -> Option<Surl> {
    match kind {
        JobKind::GetFile(get) => Some(get.surl.clone()),
        JobKind::PutFile(put) => Some(put.surl.clone()),
        JobKind::BringOnlineFile(bol) => Some(bol.surl.clone()),
        JobKind::LsFile(ls) => Some(ls.surl.clone()),
        JobKind::CopyFile(copy) => Some(copy.source.clone()),
        JobKind::ReserveSpace(_) | JobKind::Request(_) => None,
    }
}

struct CompletionListener {
    manager: Weak<RequestManager>,
}

impl StateChangeListener for CompletionListener {
    fn state_changed(&self, job: &Arc<Job>, transition: Transition) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_transition(job, transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_surl() {
        let surl = Surl::parse("srm://se/data/a").unwrap();
        let other = Surl::parse("srm://se/data/b").unwrap();
        let copy = JobKind::CopyFile(CopyFileRequest {
            source: surl.clone(),
            destination: other,
            overwrite: false,
        });
        assert_eq!(file_surl(&copy), Some(surl));
        let reserve = JobKind::ReserveSpace(ReserveSpaceRequest {
            size: 1,
            space_lifetime: Duration::from_secs(1),
            description: None,
            space_token: None,
        });
        assert_eq!(file_surl(&reserve), None);
    }

    #[test]
    fn test_options_builder() {
        let options = RequestOptions::new()
            .with_priority(3)
            .with_lifetime(Duration::from_secs(5))
            .with_description("nightly");
        assert_eq!(options.priority, 3);
        assert_eq!(options.lifetime, Some(Duration::from_secs(5)));
        assert_eq!(options.description.as_deref(), Some("nightly"));
    }
}
