//! Job states and the fixed transition table.
//!
//! Every job, container or file request, walks the same state machine. The
//! adjacency table below is the only authority on which moves are legal;
//! terminal states (`Done`, `Failed`, `Canceled`) have no outgoing edges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created, not yet handed to a scheduler.
    Pending,
    /// Waiting in a scheduler queue for a free slot.
    Queued,
    /// Held by a worker.
    Running,
    /// Waiting for something outside the worker, typically child requests.
    #[serde(rename = "ASYNCWAIT", alias = "ASYNC_WAIT")]
    AsyncWait,
    /// Waiting for the retry timer after a transient failure.
    #[serde(rename = "RETRYWAIT", alias = "RETRY_WAIT")]
    RetryWait,
    /// Processing finished, about to be made ready for the client.
    #[serde(rename = "RQUEUED")]
    RQueued,
    /// Ready for the client (a TURL has been handed out).
    Ready,
    Done,
    Failed,
    Canceled,
    /// Rebuilt from storage after a restart, awaiting re-validation.
    Restored,
}

use State::*;

const FROM_PENDING: &[State] = &[Queued, Running, AsyncWait, Done, Failed, Canceled, Restored];
const FROM_QUEUED: &[State] = &[Running, Failed, Canceled, Restored];
const FROM_RUNNING: &[State] = &[
    AsyncWait, RetryWait, RQueued, Ready, Done, Failed, Canceled, Restored,
];
const FROM_ASYNC_WAIT: &[State] = &[Queued, Running, RetryWait, Done, Failed, Canceled, Restored];
const FROM_RETRY_WAIT: &[State] = &[Queued, Running, Failed, Canceled, Restored];
const FROM_RQUEUED: &[State] = &[Ready, Failed, Canceled, Restored];
const FROM_READY: &[State] = &[Done, Failed, Canceled, Restored];
const FROM_RESTORED: &[State] = &[Queued, AsyncWait, Ready, Done, Failed, Canceled];

impl State {
    /// All states, in storage id order.
    pub const ALL: [State; 11] = [
        Pending, Queued, Running, AsyncWait, RetryWait, RQueued, Ready, Done, Failed, Canceled,
        Restored,
    ];

    /// Whether the state is terminal.
    pub fn is_final(self) -> bool {
        matches!(self, Done | Failed | Canceled)
    }

    /// States reachable from `self` in one transition.
    pub fn allowed_transitions(self) -> &'static [State] {
        match self {
            Pending => FROM_PENDING,
            Queued => FROM_QUEUED,
            Running => FROM_RUNNING,
            AsyncWait => FROM_ASYNC_WAIT,
            RetryWait => FROM_RETRY_WAIT,
            RQueued => FROM_RQUEUED,
            Ready => FROM_READY,
            Restored => FROM_RESTORED,
            Done | Failed | Canceled => &[],
        }
    }

    /// Check if a transition between two states is allowed.
    pub fn can_transition_to(self, to: State) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Stable numeric id used by the database schema.
    pub fn id(self) -> i16 {
        match self {
            Pending => 0,
            Queued => 1,
            Running => 2,
            AsyncWait => 3,
            RetryWait => 4,
            RQueued => 5,
            Ready => 6,
            Done => 7,
            Failed => 8,
            Canceled => 9,
            Restored => 10,
        }
    }

    pub fn from_id(id: i16) -> Option<State> {
        State::ALL.iter().copied().find(|s| s.id() == id)
    }

    /// Terminal states, for storage queries.
    pub fn terminal() -> [State; 3] {
        [Done, Failed, Canceled]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pending => "PENDING",
            Queued => "QUEUED",
            Running => "RUNNING",
            AsyncWait => "ASYNCWAIT",
            RetryWait => "RETRYWAIT",
            RQueued => "RQUEUED",
            Ready => "READY",
            Done => "DONE",
            Failed => "FAILED",
            Canceled => "CANCELED",
            Restored => "RESTORED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace(['_', '-'], "");
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in State::ALL.iter().filter(|s| s.is_final()) {
            for to in State::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be illegal", from, to);
            }
        }
    }

    #[test]
    fn test_self_transitions_illegal() {
        for state in State::ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_adjacency() {
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(RQueued));
        assert!(RQueued.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Done));
        assert!(Restored.can_transition_to(AsyncWait));

        assert!(!Queued.can_transition_to(Done));
        assert!(!Ready.can_transition_to(Running));
        assert!(!RQueued.can_transition_to(Done));
        assert!(!Restored.can_transition_to(Running));
    }

    #[test]
    fn test_every_non_terminal_state_can_fail_and_cancel() {
        for state in State::ALL.iter().filter(|s| !s.is_final()) {
            assert!(state.can_transition_to(Failed));
            assert!(state.can_transition_to(Canceled));
        }
    }

    #[test]
    fn test_storage_ids_are_stable() {
        for state in State::ALL {
            assert_eq!(State::from_id(state.id()), Some(state));
        }
        assert_eq!(Done.id(), 7);
        assert_eq!(State::from_id(42), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!("done".parse::<State>().unwrap(), Done);
        assert_eq!("retry_wait".parse::<State>().unwrap(), RetryWait);
        assert_eq!("AsyncWait".parse::<State>().unwrap(), AsyncWait);
        assert!("finished".parse::<State>().is_err());
    }

    #[test]
    fn test_json_spelling_matches_display() {
        for state in State::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
            assert_eq!(serde_json::from_str::<State>(&json).unwrap(), state);
        }
        let legacy: State = serde_json::from_str("\"ASYNC_WAIT\"").unwrap();
        assert_eq!(legacy, AsyncWait);
    }
}
