use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

use crate::error::{CoreError, ErrorContext, Result};

/// Cooperative cancellation signal accepted by every long-running
/// operation. Cloning shares the signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }

    /// Checkpoint between suspension points.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(CoreError::aborted(ErrorContext::for_operation(operation)))
        } else {
            Ok(())
        }
    }

    /// Races `fut` against cancellation. In-flight I/O is abandoned when
    /// the token fires and the caller sees `operation-aborted`.
    pub async fn guard<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(CoreError::aborted(ErrorContext::for_operation(operation))),
            res = fut => res,
        }
    }
}
