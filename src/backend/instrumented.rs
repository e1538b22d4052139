//! Metrics decorator for storage backends.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{BackendError, FileMetaData, SpaceReservation, StorageBackend, TransferUrl};
use crate::job::{SrmUser, Surl};
use crate::metrics::MetricsCollector;

/// Wraps a backend and records a call counter and a latency observation for
/// every operation, labeled by operation name and result.
#[derive(Debug)]
pub struct InstrumentedBackend<B> {
    inner: B,
    metrics: MetricsCollector,
}

impl<B: StorageBackend> InstrumentedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn observe<T, F>(&self, operation: &'static str, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();
        let status = match &result {
            Ok(_) => "success",
            Err(e) => {
                debug!(operation, error = %e, "Backend call failed");
                e.label()
            }
        };
        self.metrics.record_backend_call(operation, status, elapsed);
        result
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for InstrumentedBackend<B> {
    async fn prepare_to_get(
        &self,
        user: &SrmUser,
        surl: &Surl,
        protocols: &[String],
    ) -> Result<TransferUrl, BackendError> {
        self.observe("prepare_to_get", self.inner.prepare_to_get(user, surl, protocols))
            .await
    }

    async fn prepare_to_put(
        &self,
        user: &SrmUser,
        surl: &Surl,
        size: Option<u64>,
        overwrite: bool,
        protocols: &[String],
    ) -> Result<TransferUrl, BackendError> {
        self.observe(
            "prepare_to_put",
            self.inner
                .prepare_to_put(user, surl, size, overwrite, protocols),
        )
        .await
    }

    async fn put_done(
        &self,
        user: &SrmUser,
        surl: &Surl,
        file_id: &str,
    ) -> Result<(), BackendError> {
        self.observe("put_done", self.inner.put_done(user, surl, file_id))
            .await
    }

    async fn abort_put(
        &self,
        user: &SrmUser,
        surl: &Surl,
        file_id: &str,
    ) -> Result<(), BackendError> {
        self.observe("abort_put", self.inner.abort_put(user, surl, file_id))
            .await
    }

    async fn pin(
        &self,
        user: &SrmUser,
        surl: &Surl,
        lifetime: Duration,
    ) -> Result<String, BackendError> {
        self.observe("pin", self.inner.pin(user, surl, lifetime)).await
    }

    async fn unpin(&self, user: &SrmUser, surl: &Surl, pin_id: &str) -> Result<(), BackendError> {
        self.observe("unpin", self.inner.unpin(user, surl, pin_id)).await
    }

    async fn remove(&self, user: &SrmUser, surl: &Surl) -> Result<(), BackendError> {
        self.observe("remove", self.inner.remove(user, surl)).await
    }

    async fn list_directory(
        &self,
        user: &SrmUser,
        surl: &Surl,
        depth: u32,
    ) -> Result<Vec<FileMetaData>, BackendError> {
        self.observe("list_directory", self.inner.list_directory(user, surl, depth))
            .await
    }

    async fn copy(
        &self,
        user: &SrmUser,
        source: &Surl,
        destination: &Surl,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        self.observe(
            "copy",
            self.inner.copy(user, source, destination, overwrite),
        )
        .await
    }

    async fn reserve_space(
        &self,
        user: &SrmUser,
        size: u64,
        lifetime: Duration,
        description: Option<&str>,
    ) -> Result<SpaceReservation, BackendError> {
        self.observe(
            "reserve_space",
            self.inner.reserve_space(user, size, lifetime, description),
        )
        .await
    }

    async fn release_space(&self, user: &SrmUser, token: &str) -> Result<(), BackendError> {
        self.observe("release_space", self.inner.release_space(user, token))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalStorage;
    use crate::metrics::{init_metrics, BACKEND_CALLS_TOTAL};

    fn calls(operation: &str, status: &str) -> f64 {
        BACKEND_CALLS_TOTAL
            .get()
            .map(|c| c.with_label_values(&[operation, status]).get())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_records_success_and_failure() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present"), b"x").unwrap();
        let backend = InstrumentedBackend::new(LocalStorage::new(dir.path()));
        let user = SrmUser::new("metrics");

        let ok_before = calls("pin", "success");
        let err_before = calls("pin", "invalid_path");

        let present = Surl::parse("srm://localhost/present").unwrap();
        let missing = Surl::parse("srm://localhost/missing").unwrap();
        assert!(backend.pin(&user, &present, Duration::from_secs(1)).await.is_ok());
        assert!(matches!(
            backend.pin(&user, &missing, Duration::from_secs(1)).await,
            Err(BackendError::InvalidPath(_))
        ));

        assert!(calls("pin", "success") >= ok_before + 1.0);
        assert!(calls("pin", "invalid_path") >= err_before + 1.0);
    }
}
