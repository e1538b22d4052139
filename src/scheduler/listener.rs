//! State change notification.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::job::{Job, Transition};

/// Observer of job transitions.
///
/// Called after the transition is applied and persisted, with no scheduler
/// or job lock held. Implementations must not block; longer work belongs in a
/// spawned task.
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, job: &Arc<Job>, transition: Transition);
}

/// Shared, growable set of listeners.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn StateChangeListener>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, job: &Arc<Job>, transition: Transition) {
        // Cloned so a listener may register another one without deadlocking.
        let listeners = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.state_changed(job, transition);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::job::kind::BringOnlineFileRequest;
    use crate::job::{JobId, JobKind, SrmUser, State, Surl};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(JobId, State, State)>>,
    }

    impl StateChangeListener for Recorder {
        fn state_changed(&self, job: &Arc<Job>, transition: Transition) {
            // History is already appended when listeners run.
            assert_eq!(job.last_history().map(|h| h.to), Some(transition.to));
            self.seen
                .lock()
                .unwrap()
                .push((transition.job_id, transition.from, transition.to));
        }
    }

    #[test]
    fn test_notify_all() {
        let listeners = Listeners::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        listeners.add(first.clone());
        listeners.add(second.clone());
        assert_eq!(listeners.len(), 2);

        let job = Arc::new(Job::new(
            JobId(1),
            SrmUser::new("bob"),
            JobKind::BringOnlineFile(BringOnlineFileRequest {
                surl: Surl::parse("srm://se/data/x").unwrap(),
                pin_id: None,
            }),
            Duration::from_secs(10),
        ));
        let transition = job.transition(State::Queued, "queued").unwrap();
        listeners.notify(&job, transition);

        for recorder in [first, second] {
            assert_eq!(
                *recorder.seen.lock().unwrap(),
                vec![(JobId(1), State::Pending, State::Queued)]
            );
        }
    }
}
