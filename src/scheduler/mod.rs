//! Per-type job schedulers.
//!
//! - **Scheduler**: one per job type; admits jobs into a priority queue and
//!   keeps at most `max_active_jobs` of them on worker tasks
//! - **SchedulerContainer**: routes jobs to their scheduler and fans
//!   administrative operations out to all of them
//! - **JobProcessor**: the work a worker runs for a job
//! - **StateChangeListener**: observer of every applied transition
//!
//! # Architecture
//!
//! ```text
//!  schedule(job) ──► SchedulerContainer ──► Scheduler[type]
//!                                            │  Queued (priority, FIFO)
//!                                            ▼
//!                                       dispatch ──► worker task ──► JobProcessor
//!                                            ▲                           │
//!                                            └──── result → state ◄──────┘
//! ```
//!
//! Processing errors and panics are converted to job states on the worker
//! task and never reach the dispatch loop.

pub mod container;
pub mod info;
pub mod listener;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod worker;

pub use container::{RecoveryReport, SchedulerContainer};
pub use info::{describe, SchedulerInfo};
pub use listener::{Listeners, StateChangeListener};
pub use queue::JobQueue;
pub use scheduler::{Scheduler, SHUTDOWN_DESCRIPTION, SITE_BUSY_DESCRIPTION};
pub use worker::{JobContext, JobFailure, JobProcessor, Outcome};
