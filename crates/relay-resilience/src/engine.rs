//! Request orchestration.
//!
//! [`RequestEngine`] drives one logical remote call through admission,
//! a timed attempt, failure classification and backoff. Every wait point
//! (rate-limit wait, attempt, backoff) races the caller's cancellation token.

use crate::backoff::{sleep_or_cancel, BackoffPolicy};
use crate::rate_limiter::RateLimiter;
use crate::timeout::TimeoutManager;
use relay_core::{CancellationToken, RelayError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Default per-attempt timeout
    pub attempt_timeout: Duration,
    /// Backoff between attempts
    pub backoff: BackoffPolicy,
    /// Wait for the rate limiter instead of failing fast
    pub wait_for_admission: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            wait_for_admission: false,
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions<'a> {
    /// Name used in logs
    pub operation: &'static str,
    /// Token observed at every wait point
    pub token: Option<&'a CancellationToken>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
    /// Retry budget override
    pub max_retries: Option<u32>,
}

impl<'a> CallOptions<'a> {
    /// Options for a named operation
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    /// Observe a cancellation token
    #[must_use]
    pub fn with_token(mut self, token: Option<&'a CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Override the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Terminal result of one logical call
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    /// Payload on success
    pub value: Option<T>,
    /// Terminal error, including `Cancelled`
    pub error: Option<RelayError>,
    /// Attempts actually sent
    pub attempts: u32,
    /// Whether the call ended by cancellation
    pub cancelled: bool,
    /// Backoff delays taken between attempts, in order
    pub backoff_delays: Vec<Duration>,
}

impl<T> CallOutcome<T> {
    fn success(value: T, state: RetryState) -> Self {
        Self {
            value: Some(value),
            error: None,
            attempts: state.attempts,
            cancelled: false,
            backoff_delays: state.delays,
        }
    }

    fn failure(error: RelayError, state: RetryState) -> Self {
        Self {
            value: None,
            cancelled: error.is_cancelled(),
            error: Some(error),
            attempts: state.attempts,
            backoff_delays: state.delays,
        }
    }

    /// Outcome for a call that failed before any attempt could be built
    #[must_use]
    pub fn rejected(error: RelayError) -> Self {
        Self::failure(error, RetryState::default())
    }

    /// Whether the call produced a payload
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Human-readable failure message
    ///
    /// `None` on success and on cancellation; cancellation is reported only
    /// through [`cancelled`](Self::cancelled).
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if self.cancelled {
            return None;
        }
        let error = self.error.as_ref()?;
        let message = error.user_message();
        Some(if self.attempts > 1 {
            format!("{message} (after {} attempts)", self.attempts)
        } else {
            message
        })
    }

    /// Convert into a plain result
    ///
    /// # Errors
    /// Returns the terminal error of a failed or cancelled call
    pub fn into_result(self) -> Result<T, RelayError> {
        match (self.value, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(RelayError::malformed("call ended without a result")),
        }
    }
}

/// Book-keeping for one call
#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    last_status: Option<u16>,
    delays: Vec<Duration>,
}

/// Orchestrates admission, timeouts, retries and cancellation
#[derive(Debug, Clone)]
pub struct RequestEngine {
    limiter: Arc<RateLimiter>,
    config: EngineConfig,
}

impl RequestEngine {
    /// Create a new engine sharing `limiter`
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, config: EngineConfig) -> Self {
        Self { limiter, config }
    }

    /// Shared rate limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `attempt` until it succeeds, fails terminally, or is cancelled
    ///
    /// `attempt` receives the zero-based attempt number and must build a fresh
    /// request each time.
    pub async fn execute<T, F, Fut>(&self, options: CallOptions<'_>, mut attempt: F) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let operation = options.operation;
        let token = options.token;
        let timeout = options.timeout.unwrap_or(self.config.attempt_timeout);
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let mut state = RetryState::default();

        loop {
            if let Some(token) = token {
                if let Err(e) = token.check() {
                    info!(operation, attempts = state.attempts, "Call cancelled");
                    return CallOutcome::failure(e, state);
                }
            }

            if let Err(wait) = self.limiter.try_admit() {
                if !self.config.wait_for_admission {
                    let e = RelayError::rate_limited_locally(wait);
                    warn!(
                        operation,
                        wait_ms = wait.as_millis(),
                        attempts = state.attempts,
                        "Call rejected by local rate limiter"
                    );
                    return CallOutcome::failure(e, state);
                }

                debug!(operation, wait_ms = wait.as_millis(), "Waiting for rate limiter");
                if let Err(e) = sleep_or_cancel(wait, token).await {
                    info!(operation, attempts = state.attempts, "Call cancelled during rate-limit wait");
                    return CallOutcome::failure(e, state);
                }
                continue;
            }

            let attempt_number = state.attempts;
            state.attempts += 1;
            debug!(operation, attempt = state.attempts, timeout_ms = timeout.as_millis(), "Attempt started");

            let result = Self::run_attempt(attempt(attempt_number), timeout, token).await;

            let error = match result {
                Ok(value) => {
                    if state.attempts > 1 {
                        info!(operation, attempts = state.attempts, "Call succeeded after retries");
                    } else {
                        debug!(operation, "Call succeeded");
                    }
                    return CallOutcome::success(value, state);
                }
                Err(e) => e,
            };

            if error.is_cancelled() {
                info!(operation, attempts = state.attempts, "Call cancelled in flight");
                return CallOutcome::failure(error, state);
            }

            state.last_status = error.status_code().or(state.last_status);

            if !error.is_retryable() || attempt_number >= max_retries {
                error!(
                    operation,
                    attempts = state.attempts,
                    status = ?state.last_status,
                    error_code = error.error_code(),
                    error = %error,
                    "Call failed"
                );
                return CallOutcome::failure(error, state);
            }

            let delay = self.config.backoff.delay_for(attempt_number);
            warn!(
                operation,
                attempt = state.attempts,
                status = ?state.last_status,
                error = %error,
                delay_ms = delay.as_millis(),
                "Attempt failed, retrying"
            );
            state.delays.push(delay);

            if let Err(e) = sleep_or_cancel(delay, token).await {
                info!(operation, attempts = state.attempts, "Call cancelled during backoff");
                return CallOutcome::failure(e, state);
            }
        }
    }

    async fn run_attempt<T, Fut>(
        fut: Fut,
        timeout: Duration,
        token: Option<&CancellationToken>,
    ) -> Result<T, RelayError>
    where
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let timed = TimeoutManager::with_timeout(fut, timeout);
        match token {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => Err(RelayError::cancelled(token.reason().unwrap_or_default())),
                result = timed => result,
            },
            None => timed.await,
        }
    }
}
