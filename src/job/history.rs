use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::State;

/// One entry in a job's append-only transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistory {
    /// Position in the log, starting at 0. Together with the job id this is
    /// the storage key of the entry.
    pub seq: u32,
    pub transition_time: DateTime<Utc>,
    pub from: State,
    pub to: State,
    pub description: String,
}

impl fmt::Display for JobHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}: {}",
            self.transition_time.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.from,
            self.to,
            self.description
        )
    }
}
