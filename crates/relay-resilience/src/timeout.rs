//! Per-attempt timeout management.
//!
//! Each attempt of a remote call gets a fresh timeout window; the total
//! wall-clock bound of a call is the sum of attempt timeouts and backoffs.

use relay_core::RelayError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Per-attempt timeout for chat completions
    pub inference: Duration,
    /// Per-attempt timeout for audio uploads
    pub transcription: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            inference: Duration::from_secs(60),
            transcription: Duration::from_secs(120),
        }
    }
}

/// Timeout manager
#[derive(Debug, Clone, Copy)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    /// Create a new timeout manager
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TimeoutConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Attempt timeout for an inference call, honoring a non-zero override
    #[must_use]
    pub fn inference_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.inference)
    }

    /// Attempt timeout for a transcription call, honoring a non-zero override
    #[must_use]
    pub fn transcription_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.transcription)
    }

    /// Execute an operation with a timeout
    ///
    /// # Errors
    /// Returns `RelayError::Timeout` if the operation times out, otherwise the
    /// operation's own result
    pub async fn with_timeout<F, T>(future: F, timeout: Duration) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        if let Ok(result) = tokio::time::timeout(timeout, future).await {
            result
        } else {
            warn!(timeout_ms = timeout.as_millis(), "Request timed out");
            Err(RelayError::timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_success() {
        let result = TimeoutManager::with_timeout(
            async {
                sleep(Duration::from_millis(10)).await;
                Ok(42)
            },
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(result.expect("completes in time"), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exceeded() {
        let result: Result<u32, RelayError> = TimeoutManager::with_timeout(
            async {
                sleep(Duration::from_secs(10)).await;
                Ok(42)
            },
            Duration::from_millis(50),
        )
        .await;

        match result {
            Err(RelayError::Timeout { duration }) => {
                assert_eq!(duration, Duration::from_millis(50));
            }
            other => panic!("Expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<u32, RelayError> = TimeoutManager::with_timeout(
            async { Err(RelayError::malformed("empty body")) },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(RelayError::MalformedResponse { .. })));
    }

    #[test]
    fn test_inference_timeout_override() {
        let tm = TimeoutManager::with_defaults();
        assert_eq!(tm.inference_timeout(None), Duration::from_secs(60));
        assert_eq!(
            tm.inference_timeout(Some(Duration::from_secs(15))),
            Duration::from_secs(15)
        );
        assert_eq!(tm.inference_timeout(Some(Duration::ZERO)), Duration::from_secs(60));
        assert_eq!(tm.transcription_timeout(None), Duration::from_secs(120));
    }
}
