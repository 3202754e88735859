//! Exponential backoff with jitter, and cancellable waiting.

use rand::Rng;
use relay_core::{CancellationToken, RelayError};
use std::time::Duration;

/// Backoff policy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (before jitter)
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Upper bound on the random jitter added to each delay
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_jitter: Duration::from_millis(1_000),
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, useful where delays must be predictable
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Delay before retry number `retry` (0 for the first retry)
    ///
    /// `min(max_delay, base_delay * 2^retry + random(0..=max_jitter))`
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(retry));

        let jitter_max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(0);
        let jitter = if jitter_max > 0 {
            rand::thread_rng().gen_range(0..=jitter_max)
        } else {
            0
        };

        Duration::from_millis(exponential.saturating_add(jitter)).min(self.max_delay)
    }
}

/// Sleep for `duration`, returning early if `token` is cancelled
///
/// # Errors
/// Returns `RelayError::Cancelled` if the token fires before the delay elapses
pub async fn sleep_or_cancel(
    duration: Duration,
    token: Option<&CancellationToken>,
) -> Result<(), RelayError> {
    let Some(token) = token else {
        tokio::time::sleep(duration).await;
        return Ok(());
    };

    tokio::select! {
        biased;
        () = token.cancelled() => Err(RelayError::cancelled(token.reason().unwrap_or_default())),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
