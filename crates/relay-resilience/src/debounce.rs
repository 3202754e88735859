//! Trailing-edge debouncing.
//!
//! A [`Debouncer`] owns one background task and one timer. Every
//! [`trigger`](Debouncer::trigger) restarts the timer; the action runs only
//! once the timer elapses with no further triggers. Shutting down cancels a
//! pending timer without running the action.

use parking_lot::Mutex;
use relay_core::CancellationToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Collapses bursts of triggers into one delayed action
pub struct Debouncer {
    name: String,
    delay: Duration,
    tx: mpsc::UnboundedSender<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Spawn the debounce task on the current tokio runtime
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime
    pub fn spawn<F>(name: impl Into<String>, delay: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::spawn_on(&Handle::current(), name, delay, action)
    }

    /// Spawn the debounce task on `handle`
    ///
    /// Triggers may then come from any thread, including ones the runtime
    /// does not own.
    pub fn spawn_on<F>(handle: &Handle, name: impl Into<String>, delay: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = handle.spawn(Self::run(
            name.clone(),
            delay,
            rx,
            shutdown.clone(),
            Arc::new(action),
        ));

        Self {
            name,
            delay,
            tx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        name: String,
        delay: Duration,
        mut rx: mpsc::UnboundedReceiver<()>,
        shutdown: CancellationToken,
        action: Arc<dyn Fn() + Send + Sync>,
    ) {
        loop {
            // Idle: wait for the first trigger of a burst.
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                msg = rx.recv() => if msg.is_none() { return },
            }

            // Pending: every further trigger restarts the timer.
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        debug!(debouncer = %name, "Pending debounce dropped on shutdown");
                        return;
                    }
                    msg = rx.recv() => match msg {
                        Some(()) => trace!(debouncer = %name, "Debounce timer restarted"),
                        None => return,
                    },
                    () = tokio::time::sleep(delay) => {
                        debug!(debouncer = %name, delay_ms = delay.as_millis(), "Debounce fired");
                        action();
                        break;
                    }
                }
            }
        }
    }

    /// Restart the timer
    pub fn trigger(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        // A closed channel means the task already stopped.
        let _ = self.tx.send(());
    }

    /// Configured delay
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the debouncer has been shut down
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel any pending timer and stop the task
    pub fn shutdown(&self) {
        if self.shutdown.cancel("debouncer shut down") {
            debug!(debouncer = %self.name, "Debouncer shut down");
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
