//! The engine context and its startup handle.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::backend::StorageBackend;
use crate::config::SrmConfig;
use crate::error::SrmError;
use crate::job::{JobId, JobIdGenerator, JobRegistry};
use crate::request::{RequestManager, RequestProcessor};
use crate::scheduler::{Listeners, RecoveryReport, SchedulerContainer};
use crate::storage::JobStorage;

/// Everything a running engine consists of.
///
/// Built once by [`Srm::start`] and passed to whoever needs it; there is no
/// global instance.
pub struct Srm {
    config: SrmConfig,
    storage: Arc<dyn JobStorage>,
    backend: Arc<dyn StorageBackend>,
    container: Arc<SchedulerContainer>,
    registry: Arc<JobRegistry>,
    manager: Arc<RequestManager>,
    ids: Arc<JobIdGenerator>,
    recovery: RecoveryReport,
}

impl Srm {
    /// Seeds the id generator from storage, builds and starts the
    /// schedulers, then restores active jobs.
    pub async fn start(
        config: SrmConfig,
        storage: Arc<dyn JobStorage>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Arc<Self>, SrmError> {
        config.validate()?;

        let max_id = storage.max_job_id().await?;
        let ids = Arc::new(JobIdGenerator::seeded_from(max_id));
        let registry = Arc::new(JobRegistry::new());
        let listeners = Listeners::new();

        let container = Arc::new_cyclic(|container| {
            let processor = Arc::new(RequestProcessor::new(
                backend.clone(),
                container.clone(),
                registry.clone(),
            ));
            SchedulerContainer::new(&config, processor, storage.clone(), listeners.clone())
        });
        let manager = RequestManager::new(
            config.clone(),
            container.clone(),
            registry.clone(),
            storage.clone(),
            backend.clone(),
            ids.clone(),
        );

        container.start()?;
        let recovery = manager.recover().await?;
        info!(
            next_id = %ids.peek(),
            restored = recovery.restored,
            "SRM started"
        );

        Ok(Arc::new(Self {
            config,
            storage,
            backend,
            container,
            registry,
            manager,
            ids,
            recovery,
        }))
    }

    pub fn config(&self) -> &SrmConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn schedulers(&self) -> &Arc<SchedulerContainer> {
        &self.container
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.manager
    }

    pub fn ids(&self) -> &Arc<JobIdGenerator> {
        &self.ids
    }

    /// What startup recovery found.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Stops every scheduler, waiting up to the configured grace period.
    pub async fn shutdown(&self) -> Vec<JobId> {
        let leftovers = self.container.shutdown(self.config.shutdown_grace).await;
        info!(leftovers = leftovers.len(), "SRM stopped");
        leftovers
    }
}

impl fmt::Debug for Srm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Srm")
            .field("container", &self.container)
            .field("live_jobs", &self.registry.len())
            .field("next_id", &self.ids.peek())
            .finish_non_exhaustive()
    }
}

/// Publishes the engine once startup has finished.
///
/// Components created before the engine exists hold a handle and await
/// [`SrmHandle::get`] instead of polling.
#[derive(Debug, Clone)]
pub struct SrmHandle {
    tx: Arc<watch::Sender<Option<Arc<Srm>>>>,
    rx: watch::Receiver<Option<Arc<Srm>>>,
}

impl SrmHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn publish(&self, srm: Arc<Srm>) {
        self.tx.send_replace(Some(srm));
    }

    /// The engine, if already published.
    pub fn try_get(&self) -> Option<Arc<Srm>> {
        self.rx.borrow().clone()
    }

    /// Waits until the engine is published.
    pub async fn get(&self) -> Result<Arc<Srm>, SrmError> {
        let mut rx = self.rx.clone();
        let published = rx
            .wait_for(|srm| srm.is_some())
            .await
            .map_err(|_| SrmError::ShutDown)?
            .clone();
        published.ok_or(SrmError::ShutDown)
    }
}

impl Default for SrmHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::LocalStorage;
    use crate::job::JobId;
    use crate::storage::InMemoryJobStorage;

    #[tokio::test]
    async fn test_handle_waits_for_publish() {
        let dir = tempfile::tempdir().unwrap();
        let handle = SrmHandle::new();
        assert!(handle.try_get().is_none());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.get().await.map(|srm| srm.ids().peek()) })
        };

        let srm = Srm::start(
            SrmConfig::default(),
            Arc::new(InMemoryJobStorage::new()),
            Arc::new(LocalStorage::new(dir.path())),
        )
        .await
        .unwrap();
        handle.publish(srm.clone());

        let next = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next, JobId(1));
        srm.shutdown().await;
    }
}
