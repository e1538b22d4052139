//! SRM requests: containers of file requests.
//!
//! A client request (get, put, copy, bring-online, ls) becomes one container
//! job plus one child job per file. Children are scheduled on their type's
//! scheduler; the container's state follows from theirs through a
//! [`CompletionPolicy`]. Space reservations are single jobs.

pub mod container;
pub mod manager;
pub mod processors;

pub use container::{evaluate, CompletionPolicy};
pub use manager::{FileStatus, PutFileSpec, RequestManager, RequestOptions, RequestStatus};
pub use processors::RequestProcessor;
