//! Processing of each job kind against the storage backend.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use crate::job::kind::RequestSpec;
use crate::job::{JobKind, JobRegistry, JobType, State};
use crate::scheduler::{JobContext, JobFailure, JobProcessor, Outcome, SchedulerContainer};

/// Runs file requests against the backend and fans copy requests out to
/// their children.
pub struct RequestProcessor {
    backend: Arc<dyn StorageBackend>,
    container: Weak<SchedulerContainer>,
    registry: Arc<JobRegistry>,
}

impl RequestProcessor {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        container: Weak<SchedulerContainer>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            backend,
            container,
            registry,
        }
    }

    /// Schedules the copy request's pending children on the copy scheduler.
    async fn fan_out(&self, ctx: &JobContext, spec: &RequestSpec) -> Result<Outcome, JobFailure> {
        let container = self
            .container
            .upgrade()
            .ok_or_else(|| JobFailure::Fatal("SRM is shutting down.".to_string()))?;

        let mut scheduled = 0;
        for child_id in &spec.children {
            if ctx.is_cancelled() {
                break;
            }
            let Some(child) = self.registry.get(*child_id) else {
                warn!(job_id = %ctx.job().id(), child = %child_id, "Copy request child is not registered");
                continue;
            };
            if child.state() != State::Pending {
                continue;
            }
            match container.schedule(child).await {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(job_id = %ctx.job().id(), child = %child_id, error = %e, "Could not schedule copy"),
            }
        }

        debug!(job_id = %ctx.job().id(), scheduled, "Copy request fanned out");
        Ok(Outcome::AsyncWait(format!(
            "Scheduled {} of {} file requests.",
            scheduled,
            spec.children.len()
        )))
    }
}

#[async_trait]
impl JobProcessor for RequestProcessor {
    async fn process(&self, ctx: &JobContext) -> Result<Outcome, JobFailure> {
        let job = ctx.job();
        let user = job.user();

        match job.kind() {
            JobKind::GetFile(get) => {
                let pin_id = self
                    .backend
                    .pin(user, &get.surl, job.remaining_lifetime())
                    .await?;
                let turl = match self.backend.prepare_to_get(user, &get.surl, &get.protocols).await {
                    Ok(turl) => turl,
                    Err(e) => {
                        let _ = self.backend.unpin(user, &get.surl, &pin_id).await;
                        return Err(e.into());
                    }
                };
                if ctx.is_cancelled() {
                    let _ = self.backend.unpin(user, &get.surl, &pin_id).await;
                    return Err(JobFailure::Canceled("Canceled while preparing.".to_string()));
                }
                let description = format!("Transfer URL {} ready.", turl.turl);
                job.update_kind(|kind| {
                    if let JobKind::GetFile(get) = kind {
                        get.turl = Some(turl.turl);
                        get.file_id = Some(turl.file_id);
                        get.pin_id = Some(pin_id);
                    }
                });
                Ok(Outcome::Ready(description))
            }
            JobKind::PutFile(put) => {
                let turl = self
                    .backend
                    .prepare_to_put(user, &put.surl, put.size, put.overwrite, &put.protocols)
                    .await?;
                if ctx.is_cancelled() {
                    let _ = self.backend.abort_put(user, &put.surl, &turl.file_id).await;
                    return Err(JobFailure::Canceled("Canceled while preparing.".to_string()));
                }
                let description = format!("Transfer URL {} ready.", turl.turl);
                job.update_kind(|kind| {
                    if let JobKind::PutFile(put) = kind {
                        put.turl = Some(turl.turl);
                        put.file_id = Some(turl.file_id);
                    }
                });
                Ok(Outcome::Ready(description))
            }
            JobKind::BringOnlineFile(bol) => {
                let pin_id = self
                    .backend
                    .pin(user, &bol.surl, job.remaining_lifetime())
                    .await?;
                let description = format!("File online, pin {}.", pin_id);
                job.update_kind(|kind| {
                    if let JobKind::BringOnlineFile(bol) = kind {
                        bol.pin_id = Some(pin_id);
                    }
                });
                Ok(Outcome::Done(description))
            }
            JobKind::LsFile(ls) => {
                let entries = self.backend.list_directory(user, &ls.surl, ls.depth).await?;
                let description = format!("Listed {} entries.", entries.len());
                job.update_kind(|kind| {
                    if let JobKind::LsFile(ls) = kind {
                        ls.entries = entries;
                    }
                });
                Ok(Outcome::Done(description))
            }
            JobKind::CopyFile(copy) => {
                self.backend
                    .copy(user, &copy.source, &copy.destination, copy.overwrite)
                    .await?;
                Ok(Outcome::Done(format!("Copied to {}.", copy.destination)))
            }
            JobKind::ReserveSpace(reserve) => {
                let reservation = self
                    .backend
                    .reserve_space(
                        user,
                        reserve.size,
                        reserve.space_lifetime,
                        reserve.description.as_deref(),
                    )
                    .await?;
                let description = format!(
                    "Reserved {} bytes, token {}.",
                    reservation.size, reservation.token
                );
                job.update_kind(|kind| {
                    if let JobKind::ReserveSpace(reserve) = kind {
                        reserve.space_token = Some(reservation.token);
                    }
                });
                Ok(Outcome::Done(description))
            }
            JobKind::Request(spec) if spec.request_type == JobType::Copy => {
                self.fan_out(ctx, &spec).await
            }
            JobKind::Request(spec) => Err(JobFailure::Fatal(format!(
                "{} requests are not processed by a scheduler.",
                spec.request_type
            ))),
        }
    }
}
