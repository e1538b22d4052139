use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::job::Job;
use super::types::JobId;

/// Live jobs by id.
///
/// Holds every job that is active or still needed by an active container.
/// Finished jobs are evicted and read back from storage when asked for.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Arc<Job>) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id(), job);
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live jobs, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id());
        jobs
    }

    /// Live jobs without a parent: containers and stand-alone requests.
    pub fn top_level(&self) -> Vec<Arc<Job>> {
        self.snapshot()
            .into_iter()
            .filter(|job| job.parent_id().is_none())
            .collect()
    }
}
