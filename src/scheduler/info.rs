//! Diagnostic snapshots of schedulers.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::job::{Job, JobId, JobType, State};

/// Point-in-time view of one scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerInfo {
    pub id: String,
    pub job_type: JobType,
    pub running: bool,
    pub max_active_jobs: usize,
    pub max_requests: usize,
    pub active: usize,
    pub queued: usize,
    /// Tracked jobs per state.
    pub states: BTreeMap<State, usize>,
}

impl SchedulerInfo {
    /// (active + queued) / max_active_jobs.
    pub fn load(&self) -> f64 {
        load(self.active, self.queued, self.max_active_jobs)
    }

    pub fn tracked(&self) -> usize {
        self.states.values().sum()
    }
}

impl fmt::Display for SchedulerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} scheduler [{}]: {} active / {} max, {} queued, {} tracked (max {}), load {:.2}",
            self.job_type,
            if self.running { "running" } else { "stopped" },
            self.active,
            self.max_active_jobs,
            self.queued,
            self.tracked(),
            self.max_requests,
            self.load()
        )?;
        for (state, count) in &self.states {
            write!(f, "\n  {:<10} {}", state, count)?;
        }
        Ok(())
    }
}

pub(crate) fn load(active: usize, queued: usize, max_active_jobs: usize) -> f64 {
    let busy = (active + queued) as f64;
    if max_active_jobs == 0 {
        if busy > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        busy / max_active_jobs as f64
    }
}

/// One-line description of a job, used in listings and pattern cancellation.
pub fn describe(job: &Job) -> String {
    format!(
        "{} {} {} p={} {}",
        job.id(),
        job.job_type(),
        job.state(),
        job.priority(),
        job.summary()
    )
}

/// Listing of a set of jobs with the queue order.
pub(crate) fn detailed(info: &SchedulerInfo, jobs: &[(JobId, String)], queue: &[JobId]) -> String {
    let mut out = info.to_string();
    if !queue.is_empty() {
        let order: Vec<String> = queue.iter().map(|id| id.to_string()).collect();
        out.push_str(&format!("\n  queue: {}", order.join(" ")));
    }
    for (_, line) in jobs {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        assert_eq!(load(0, 0, 0), 0.0);
        assert!(load(1, 0, 0).is_infinite());
        assert_eq!(load(2, 3, 5), 1.0);
    }

    #[test]
    fn test_display() {
        let info = SchedulerInfo {
            id: "get".into(),
            job_type: JobType::Get,
            running: true,
            max_active_jobs: 2,
            max_requests: 100,
            active: 2,
            queued: 2,
            states: BTreeMap::from([(State::Queued, 2), (State::Running, 2)]),
        };
        let text = info.to_string();
        assert!(text.starts_with("get scheduler [running]: 2 active / 2 max, 2 queued"));
        assert!(text.contains("load 2.00"));
        assert!(text.contains("RUNNING"));
    }
}
