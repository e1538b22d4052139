use std::sync::atomic::{AtomicI64, Ordering};

use super::types::JobId;

/// Monotonic job id source.
///
/// Seeded from the highest id already in storage so that ids handed out after
/// a restart never collide with persisted jobs.
#[derive(Debug)]
pub struct JobIdGenerator {
    next: AtomicI64,
}

impl JobIdGenerator {
    pub fn new(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    /// Generator continuing after `max`, or starting at 1 for an empty store.
    pub fn seeded_from(max: Option<JobId>) -> Self {
        Self::new(max.map(|id| id.0 + 1).unwrap_or(1))
    }

    pub fn next_id(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next call will return.
    pub fn peek(&self) -> JobId {
        JobId(self.next.load(Ordering::SeqCst))
    }
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeding() {
        assert_eq!(JobIdGenerator::seeded_from(None).next_id(), JobId(1));
        let ids = JobIdGenerator::seeded_from(Some(JobId(41)));
        assert_eq!(ids.next_id(), JobId(42));
        assert_eq!(ids.next_id(), JobId(43));
        assert_eq!(ids.peek(), JobId(44));
    }
}
