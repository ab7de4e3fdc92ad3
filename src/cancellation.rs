//! Cooperative cancellation for in-flight fetches.
//!
//! A [`CancellationSignal`] is handed to a query function so it can poll or
//! await cancellation; cancelling it never aborts the underlying future by
//! force (tokio tasks aren't preemptible), it just flips a flag and wakes
//! anyone `await`ing `cancelled()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cheaply cloneable handle shared between the owner of a fetch (the
/// `Query`) and the query function running it.
#[derive(Clone, Debug, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this signal cancelled. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Returns immediately if
    /// already cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// Suspension-point check a query function calls to bail out early:
    /// `Err(QueryError::Cancelled)` if this signal has been cancelled.
    pub fn throw_if_cancelled(&self) -> Result<(), crate::retry::QueryError> {
        if self.is_cancelled() {
            Err(crate::retry::QueryError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers `listener` to run once, the first time this signal is
    /// cancelled. Runs immediately, inline, if already cancelled.
    pub fn on_cancel(&self, listener: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            listener();
            return;
        }
        let signal = self.clone();
        tokio::spawn(async move {
            signal.cancelled().await;
            listener();
        });
    }

    /// Derives a child signal that's cancelled whenever `self` is (but not
    /// the reverse — cancelling the child doesn't cancel its parent). Useful
    /// for scoping a sub-fetch's lifetime to an outer one's.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let parent = self.clone();
        let child_for_task = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_for_task.cancel();
        });
        child
    }
}

/// Passed to every query function invocation; carries the signal plus the
/// attempt number so retries can be distinguished in logs.
#[derive(Clone, Debug)]
pub struct FetchContext {
    pub signal: CancellationSignal,
    pub attempt: u32,
}

impl FetchContext {
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn throw_if_cancelled(&self) -> Result<(), crate::retry::QueryError> {
        self.signal.throw_if_cancelled()
    }
}
