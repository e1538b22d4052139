//! Wait queue of a scheduler: priority first, then arrival order.
//!
//! Each scheduler keeps the jobs it has admitted but not yet handed to a
//! worker in a [`JobQueue`]. The queue supports:
//!
//! - Ordered dequeue by priority, then by push order
//! - Removal by id, for jobs canceled or expired while waiting
//! - Duplicate detection, so a job is never queued twice
//!
//! # Ordering
//!
//! Entries are keyed by `(Reverse(priority), sequence)` in a `BTreeMap`.
//! The sequence number grows with every push, so two jobs of the same
//! priority pop in the order they arrived. A second index maps job ids to
//! their keys so removal does not scan the queue.
//!
//! The queue holds ids only. The scheduler owns the jobs themselves and
//! guards the queue with its own lock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::job::JobId;

/// Sort key of a queued job: higher priority first, then lower sequence.
type QueueKey = (Reverse<u32>, u64);

/// Jobs waiting for a worker.
///
/// Higher priority pops first; equal priorities pop in the order they were
/// pushed. Removal by id is supported for cancellation.
///
/// # Example
///
/// ```
/// use srm_engine::job::JobId;
/// use srm_engine::scheduler::JobQueue;
///
/// let mut queue = JobQueue::new();
/// queue.push(JobId(1), 0);
/// queue.push(JobId(2), 5);
/// assert_eq!(queue.pop(), Some(JobId(2)));
/// assert_eq!(queue.pop(), Some(JobId(1)));
/// ```
#[derive(Debug, Default)]
pub struct JobQueue {
    /// Queued ids in dispatch order.
    entries: BTreeMap<QueueKey, JobId>,
    /// Key of every queued id, for removal.
    positions: HashMap<JobId, QueueKey>,
    /// Sequence number handed to the next push.
    next_seq: u64,
}

impl JobQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job behind every queued job of the same or higher priority.
    ///
    /// # Arguments
    ///
    /// * `id` - The job to queue
    /// * `priority` - Larger values are dispatched first
    ///
    /// # Returns
    ///
    /// `false` if the job is already queued; its position is left as is.
    pub fn push(&mut self, id: JobId, priority: u32) -> bool {
        if self.positions.contains_key(&id) {
            return false;
        }
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, id);
        self.positions.insert(id, key);
        true
    }

    /// Takes the next job to dispatch, or `None` when the queue is empty.
    pub fn pop(&mut self) -> Option<JobId> {
        let (_, id) = self.entries.pop_first()?;
        self.positions.remove(&id);
        Some(id)
    }

    /// Removes a job wherever it sits in the queue.
    ///
    /// # Returns
    ///
    /// `true` if the job was queued.
    pub fn remove(&mut self, id: JobId) -> bool {
        match self.positions.remove(&id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Whether the job is waiting in this queue.
    pub fn contains(&self, id: JobId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no job is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued ids in dispatch order.
    pub fn ids(&self) -> Vec<JobId> {
        self.entries.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = JobQueue::new();
        queue.push(JobId(1), 0);
        queue.push(JobId(2), 5);
        queue.push(JobId(3), 0);
        queue.push(JobId(4), 5);

        assert_eq!(queue.ids(), vec![JobId(2), JobId(4), JobId(1), JobId(3)]);
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec![JobId(2), JobId(4), JobId(1), JobId(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_push_ignored() {
        let mut queue = JobQueue::new();
        assert!(queue.push(JobId(1), 1));
        assert!(!queue.push(JobId(1), 9));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut queue = JobQueue::new();
        queue.push(JobId(1), 0);
        queue.push(JobId(2), 0);
        assert!(queue.remove(JobId(1)));
        assert!(!queue.remove(JobId(1)));
        assert!(!queue.contains(JobId(1)));
        assert_eq!(queue.pop(), Some(JobId(2)));
        assert_eq!(queue.pop(), None);
    }
}
