//! Storage backend interface.
//!
//! The engine never touches files itself: workers call a [`StorageBackend`]
//! for every operation on the storage system. Two implementations ship with
//! the crate:
//!
//! - [`LocalStorage`]: a storage element over a local directory tree
//! - [`InstrumentedBackend`]: a decorator recording Prometheus metrics for
//!   any backend

pub mod instrumented;
pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{SrmUser, Surl};

pub use instrumented::InstrumentedBackend;
pub use local::LocalStorage;

/// Errors returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Permission denied: {0}")]
    AuthorizationDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("No space available: {0}")]
    NoSpace(String),
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Internal(_) | BackendError::Timeout(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BackendError::AuthorizationDenied(_) => "authorization_denied",
            BackendError::InvalidPath(_) => "invalid_path",
            BackendError::Internal(_) => "internal",
            BackendError::Timeout(_) => "timeout",
            BackendError::AlreadyExists(_) => "already_exists",
            BackendError::NoSpace(_) => "no_space",
        }
    }
}

/// A transfer URL handed to the client, with the backend's handle for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferUrl {
    pub turl: String,
    pub file_id: String,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    pub surl: String,
    pub size: u64,
    pub is_directory: bool,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

/// A granted space reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceReservation {
    pub token: String,
    pub size: u64,
}

/// Operations the engine needs from the storage system.
///
/// Every call carries the requesting identity; authorization decisions are
/// the backend's business.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn prepare_to_get(
        &self,
        user: &SrmUser,
        surl: &Surl,
        protocols: &[String],
    ) -> Result<TransferUrl, BackendError>;

    async fn prepare_to_put(
        &self,
        user: &SrmUser,
        surl: &Surl,
        size: Option<u64>,
        overwrite: bool,
        protocols: &[String],
    ) -> Result<TransferUrl, BackendError>;

    /// Commits an upload started with `prepare_to_put`.
    async fn put_done(&self, user: &SrmUser, surl: &Surl, file_id: &str)
        -> Result<(), BackendError>;

    /// Discards an upload started with `prepare_to_put`.
    async fn abort_put(&self, user: &SrmUser, surl: &Surl, file_id: &str)
        -> Result<(), BackendError>;

    /// Pins a file online for `lifetime`. Returns the pin id.
    async fn pin(&self, user: &SrmUser, surl: &Surl, lifetime: Duration)
        -> Result<String, BackendError>;

    async fn unpin(&self, user: &SrmUser, surl: &Surl, pin_id: &str) -> Result<(), BackendError>;

    async fn remove(&self, user: &SrmUser, surl: &Surl) -> Result<(), BackendError>;

    async fn list_directory(
        &self,
        user: &SrmUser,
        surl: &Surl,
        depth: u32,
    ) -> Result<Vec<FileMetaData>, BackendError>;

    async fn copy(
        &self,
        user: &SrmUser,
        source: &Surl,
        destination: &Surl,
        overwrite: bool,
    ) -> Result<(), BackendError>;

    async fn reserve_space(
        &self,
        user: &SrmUser,
        size: u64,
        lifetime: Duration,
        description: Option<&str>,
    ) -> Result<SpaceReservation, BackendError>;

    async fn release_space(&self, user: &SrmUser, token: &str) -> Result<(), BackendError>;
}
