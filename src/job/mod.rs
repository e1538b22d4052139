//! Jobs: the persistent state machines tracked by the schedulers.
//!
//! - [`State`]: the closed state set and its transition table
//! - [`Job`]: identity, payload and history of one request or file request
//! - [`JobKind`]: per-type payloads (containers and file requests)
//! - [`JobRegistry`] and [`JobIdGenerator`]: live job lookup and id allocation

mod cancel;
mod history;
mod id;
#[allow(clippy::module_inception)]
mod job;
pub mod kind;
mod registry;
mod state;
mod types;

pub use cancel::CancelToken;
pub use history::JobHistory;
pub use id::JobIdGenerator;
pub use job::{Job, Transition, DEFAULT_MAX_RETRIES};
pub(crate) use job::deadline;
pub use kind::JobKind;
pub use registry::JobRegistry;
pub use state::State;
pub use types::{CredentialRef, JobId, JobType, SrmUser, Surl};

/// History description used when a job outlives its lifetime.
pub const EXPIRED_DESCRIPTION: &str = "Request lifetime expired";
