//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is created per logical operation and shared by
//! handle between the caller that may cancel it and every wait point that
//! must observe it. Cancellation is monotonic: the first `cancel` fixes the
//! reason and fires each registered observer exactly once.
//!
//! Observers are plain callbacks run synchronously inside `cancel`. Async
//! code awaits [`CancellationToken::cancelled`] instead, typically inside a
//! `tokio::select!` next to the wait it interrupts.

use crate::error::RelayError;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

type Observer = Box<dyn FnOnce(&str) + Send + 'static>;

struct Inner {
    cancelled: AtomicBool,
    reason: OnceLock<String>,
    observers: Mutex<Vec<Observer>>,
    notify: Notify,
}

/// Cancellation token shared between a producer and any number of observers
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new, not yet cancelled token
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: OnceLock::new(),
                observers: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancel the token
    ///
    /// The first call wins: it fixes `reason` and runs every observer once.
    /// Later calls are no-ops. Returns `true` if this call performed the
    /// cancellation.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();

        // The observer lock orders `cancel` against `on_cancel`: an observer is
        // either drained here or sees the flag already set.
        let observers = {
            let mut observers = self.inner.observers.lock();
            if self.inner.cancelled.load(Ordering::Acquire) {
                return false;
            }
            let _ = self.inner.reason.set(reason);
            self.inner.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut *observers)
        };

        let reason = self.reason().unwrap_or_default();
        debug!(reason = %reason, observers = observers.len(), "Operation cancelled");

        for observer in observers {
            Self::fire(observer, &reason);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Register a callback run once on cancellation
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        {
            let mut observers = self.inner.observers.lock();
            if !self.inner.cancelled.load(Ordering::Acquire) {
                observers.push(Box::new(callback));
                return;
            }
        }
        let reason = self.reason().unwrap_or_default();
        Self::fire(Box::new(callback), &reason);
    }

    /// Whether the token has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same token
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The reason given to the first `cancel` call
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.get().cloned()
    }

    /// Fail with [`RelayError::Cancelled`] if the token has been cancelled
    ///
    /// # Errors
    /// Returns `RelayError::Cancelled` carrying the cancel reason
    pub fn check(&self) -> Result<(), RelayError> {
        if self.is_cancelled() {
            Err(RelayError::cancelled(self.reason().unwrap_or_default()))
        } else {
            Ok(())
        }
    }

    /// Resolve once the token is cancelled
    ///
    /// Returns immediately for a token that is already cancelled. Dropping
    /// the future leaves nothing behind.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn fire(observer: Observer, reason: &str) {
        if catch_unwind(AssertUnwindSafe(|| observer(reason))).is_err() {
            warn!(reason = %reason, "Cancellation observer panicked");
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.inner.reason.get())
            .finish_non_exhaustive()
    }
}
