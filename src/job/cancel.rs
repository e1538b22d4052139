use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::EXPIRED_DESCRIPTION;

/// Cooperative cancellation signal shared by a job and its worker.
///
/// Setting the signal never changes the job's state; the owner converts the
/// worker's result once it returns.
#[derive(Debug, Default)]
pub struct CancelToken {
    requested: AtomicBool,
    expired: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Request cancellation because the job outlived its lifetime.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
        self.cancel(EXPIRED_DESCRIPTION);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent `cancel` is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel("user request");
        token.cancel("shutdown");
        assert!(token.is_cancelled());
        assert!(!token.is_expired());
        assert_eq!(token.reason().as_deref(), Some("user request"));
    }

    #[test]
    fn test_expire_sets_both_flags() {
        let token = CancelToken::new();
        token.expire();
        assert!(token.is_cancelled());
        assert!(token.is_expired());
        assert_eq!(token.reason().as_deref(), Some(EXPIRED_DESCRIPTION));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancelToken::new());
        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_set() {
        let token = CancelToken::new();
        token.cancel("done");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }
}
