//! In-memory job storage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{JobRecord, JobStorage, StorageError};
use crate::job::{JobId, State};

/// Process-local [`JobStorage`] keyed by job id.
///
/// Follows the same write rules as the database implementation. Can be
/// switched to unavailable to exercise persistence failures.
#[derive(Debug)]
pub struct InMemoryJobStorage {
    records: RwLock<BTreeMap<JobId, JobRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryJobStorage {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// When unavailable, every call fails with `StorageError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory storage switched off".to_string()))
        }
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn get_job(&self, id: JobId) -> Result<JobRecord, StorageError> {
        self.check_available()?;
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound(id))
    }

    async fn get_active_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|record| record.is_active())
            .cloned()
            .collect())
    }

    async fn get_latest_job_ids(
        &self,
        states: &[State],
        limit: usize,
    ) -> Result<Vec<JobId>, StorageError> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .rev()
            .filter(|record| states.contains(&record.state))
            .take(limit)
            .map(|record| record.id)
            .collect())
    }

    async fn save_job(&self, record: &JobRecord, force: bool) -> Result<(), StorageError> {
        self.check_available()?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(stored) = records.get(&record.id) {
            if stored.version() > record.version() {
                return Ok(());
            }
            if stored.version() == record.version() && !force {
                return Ok(());
            }
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn max_job_id(&self) -> Result<Option<JobId>, StorageError> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .next_back()
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::kind::LsFileRequest;
    use crate::job::{Job, JobKind, SrmUser, Surl};

    fn job(id: i64) -> Job {
        let kind = JobKind::LsFile(LsFileRequest {
            surl: Surl::parse("srm://se.example.org/dir").unwrap(),
            depth: 0,
            entries: vec![],
        });
        Job::new(JobId(id), SrmUser::new("bob"), kind, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let storage = InMemoryJobStorage::new();
        assert!(matches!(
            storage.get_job(JobId(1)).await,
            Err(StorageError::NotFound(JobId(1)))
        ));
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let storage = InMemoryJobStorage::new();
        let job = job(1);
        job.transition(State::Queued, "q").unwrap();
        let record = job.to_record();

        storage.save_job(&record, true).await.unwrap();
        storage.save_job(&record, true).await.unwrap();
        storage.save_job(&record, false).await.unwrap();

        let stored = storage.get_job(JobId(1)).await.unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.history.len(), 1);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_ignored() {
        let storage = InMemoryJobStorage::new();
        let job = job(2);
        job.transition(State::Queued, "q").unwrap();
        let older = job.to_record();
        job.transition(State::Running, "r").unwrap();
        let newer = job.to_record();

        storage.save_job(&newer, false).await.unwrap();
        storage.save_job(&older, true).await.unwrap();

        let stored = storage.get_job(JobId(2)).await.unwrap();
        assert_eq!(stored.state, State::Running);
        assert_eq!(stored.history.len(), 2);
    }

    #[tokio::test]
    async fn test_latest_ids_and_active() {
        let storage = InMemoryJobStorage::new();
        for (id, state) in [
            (1, State::Done),
            (2, State::Failed),
            (3, State::Queued),
            (4, State::Canceled),
            (5, State::Done),
        ] {
            let job = job(id);
            job.transition(state, "set").unwrap();
            storage.save_job(&job.to_record(), true).await.unwrap();
        }

        assert_eq!(
            storage.get_latest_completed_job_ids(3).await.unwrap(),
            vec![JobId(5), JobId(4), JobId(2)]
        );
        assert_eq!(
            storage.get_latest_done_job_ids(10).await.unwrap(),
            vec![JobId(5), JobId(1)]
        );
        assert_eq!(storage.get_latest_failed_job_ids(10).await.unwrap(), vec![JobId(2)]);
        assert_eq!(storage.get_latest_canceled_job_ids(10).await.unwrap(), vec![JobId(4)]);

        let active = storage.get_active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, JobId(3));
        assert_eq!(storage.max_job_id().await.unwrap(), Some(JobId(5)));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let storage = InMemoryJobStorage::new();
        storage.set_available(false);
        assert!(matches!(
            storage.max_job_id().await,
            Err(StorageError::Unavailable(_))
        ));
        storage.set_available(true);
        assert_eq!(storage.max_job_id().await.unwrap(), None);
    }
}
