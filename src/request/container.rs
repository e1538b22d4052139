//! Deriving a container request's state from its file requests.

use crate::job::{JobType, State};

/// How child outcomes combine into the container's final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Done only when every file request is done.
    AllOrNothing,
    /// Done when at least one file request is done.
    PartialSuccess,
}

impl CompletionPolicy {
    pub fn for_request(request_type: JobType) -> Self {
        match request_type {
            JobType::Ls => CompletionPolicy::PartialSuccess,
            _ => CompletionPolicy::AllOrNothing,
        }
    }
}

/// The terminal state a container should move to, or `None` while any child
/// is still active.
///
/// A container never reports more progress than its children: it is only
/// `Done` once every child it depends on is terminal.
pub fn evaluate(
    policy: CompletionPolicy,
    children: &[State],
    cancel_requested: bool,
) -> Option<(State, String)> {
    if cancel_requested {
        return Some((State::Canceled, "Request canceled.".to_string()));
    }
    if children.is_empty() {
        return Some((
            State::Failed,
            "Request contains zero file requests.".to_string(),
        ));
    }
    if children.iter().any(|state| !state.is_final()) {
        return None;
    }

    let total = children.len();
    let done = children.iter().filter(|s| **s == State::Done).count();
    let failed = total - done;

    if failed == 0 {
        return Some((State::Done, "All file requests completed.".to_string()));
    }
    match policy {
        CompletionPolicy::AllOrNothing => Some((
            State::Failed,
            format!("{} of {} file requests failed.", failed, total),
        )),
        CompletionPolicy::PartialSuccess if done > 0 => Some((
            State::Done,
            format!("Partial success: {} of {} file requests failed.", failed, total),
        )),
        CompletionPolicy::PartialSuccess => Some((
            State::Failed,
            format!("All {} file requests failed.", total),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use State::*;

    #[test]
    fn test_waits_for_active_children() {
        let policy = CompletionPolicy::AllOrNothing;
        assert_eq!(evaluate(policy, &[Done, Running], false), None);
        assert_eq!(evaluate(policy, &[Done, Ready], false), None);
        assert_eq!(evaluate(policy, &[Failed, Queued], false), None);
    }

    #[test]
    fn test_all_or_nothing() {
        let policy = CompletionPolicy::AllOrNothing;
        assert_eq!(evaluate(policy, &[Done, Done], false).unwrap().0, Done);
        let (state, description) = evaluate(policy, &[Done, Failed, Canceled], false).unwrap();
        assert_eq!(state, Failed);
        assert_eq!(description, "2 of 3 file requests failed.");
    }

    #[test]
    fn test_partial_success() {
        let policy = CompletionPolicy::for_request(JobType::Ls);
        assert_eq!(policy, CompletionPolicy::PartialSuccess);
        let (state, description) = evaluate(policy, &[Done, Failed], false).unwrap();
        assert_eq!(state, Done);
        assert!(description.starts_with("Partial success"));
        assert_eq!(evaluate(policy, &[Failed, Failed], false).unwrap().0, Failed);
    }

    #[test]
    fn test_zero_children_and_cancel() {
        let policy = CompletionPolicy::AllOrNothing;
        assert_eq!(evaluate(policy, &[], false).unwrap().0, Failed);
        assert_eq!(evaluate(policy, &[Running], true).unwrap().0, Canceled);
    }

    #[test]
    fn test_policy_per_type() {
        for job_type in [JobType::Get, JobType::Put, JobType::Copy, JobType::BringOnline] {
            assert_eq!(
                CompletionPolicy::for_request(job_type),
                CompletionPolicy::AllOrNothing
            );
        }
    }
}
