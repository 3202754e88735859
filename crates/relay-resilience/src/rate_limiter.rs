//! Sliding-window rate limiting.
//!
//! The limiter keeps the timestamps of recent admissions and admits a new
//! request only while fewer than `max_requests` fall inside the trailing
//! window. It never sleeps: callers get a yes/no answer or a wait hint and
//! decide for themselves whether to fail fast or wait.
//!
//! One limiter is shared by every call site in the process; the request
//! engine consults it before each attempt.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Granularity of the window boundary
///
/// A timestamp exactly `window` old is still inside the window; it leaves one
/// tick later.
const WINDOW_TICK: Duration = Duration::from_millis(1);

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Admissions allowed per window
    pub max_requests: u32,
    /// Trailing window length
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct WindowState {
    timestamps: VecDeque<Instant>,
    config: RateLimiterConfig,
}

impl WindowState {
    /// Drop timestamps older than the window; `[now - window, now]` is kept
    fn prune(&mut self, now: Instant) {
        let window = self.config.window;
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.timestamps.len() < self.config.max_requests as usize
    }

    fn wait_time(&self, now: Instant) -> Duration {
        if self.has_capacity() {
            return Duration::ZERO;
        }
        // The slot frees up when enough of the oldest admissions expire to
        // bring the count below capacity.
        let excess = self.timestamps.len() + 1 - self.config.max_requests as usize;
        match self.timestamps.get(excess - 1) {
            Some(&ts) => (ts + self.config.window + WINDOW_TICK).saturating_duration_since(now),
            None => self.config.window,
        }
    }
}

/// Snapshot of limiter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Admissions currently inside the window
    pub in_window: usize,
    /// Configured capacity
    pub max_requests: u32,
    /// Configured window
    pub window: Duration,
}

impl RateLimitStats {
    /// Remaining admissions in the current window
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.max_requests as usize).saturating_sub(self.in_window)
    }

    /// Utilization percentage of the window
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_requests == 0 {
            return 100.0;
        }
        (self.in_window as f64 / f64::from(self.max_requests) * 100.0).min(100.0)
    }
}

/// Sliding-window admission gate
#[derive(Debug)]
pub struct RateLimiter {
    id: String,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(id: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(WindowState {
                timestamps: VecDeque::with_capacity(config.max_requests as usize),
                config,
            }),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(id: impl Into<String>) -> Self {
        Self::new(id, RateLimiterConfig::default())
    }

    /// Get the rate limiter ID
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> RateLimiterConfig {
        self.state.lock().config
    }

    /// Change capacity and window
    ///
    /// Recorded admissions are kept; the new limits apply from the next check.
    pub fn configure(&self, max_requests: u32, window: Duration) {
        let mut state = self.state.lock();
        state.config = RateLimiterConfig {
            max_requests,
            window,
        };
        info!(
            rate_limiter = %self.id,
            max_requests,
            window_ms = window.as_millis(),
            "Rate limiter reconfigured"
        );
    }

    /// Whether a request could be admitted now
    #[must_use]
    pub fn can_admit(&self) -> bool {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        state.has_capacity()
    }

    /// Record an admission at the current time
    pub fn record_admission(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);
        state.timestamps.push_back(now);
    }

    /// Time until the next admission would be allowed (zero if allowed now)
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);
        state.wait_time(now)
    }

    /// Check and record in one step
    ///
    /// # Errors
    /// Returns the wait hint when the window is full
    pub fn try_admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);

        if state.has_capacity() {
            state.timestamps.push_back(now);
            debug!(
                rate_limiter = %self.id,
                in_window = state.timestamps.len(),
                max_requests = state.config.max_requests,
                "Admission granted"
            );
            Ok(())
        } else {
            let wait = state.wait_time(now);
            warn!(
                rate_limiter = %self.id,
                max_requests = state.config.max_requests,
                wait_ms = wait.as_millis(),
                "Rate limit exceeded"
            );
            Err(wait)
        }
    }

    /// Snapshot of the current window
    #[must_use]
    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        RateLimitStats {
            in_window: state.timestamps.len(),
            max_requests: state.config.max_requests,
            window: state.config.window,
        }
    }

    /// Forget all recorded admissions
    pub fn reset(&self) {
        self.state.lock().timestamps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimiterConfig {
                max_requests,
                window: Duration::from_millis(window_ms),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_denies_then_admits_after_expiry() {
        let limiter = limiter(3, 60_000);

        for _ in 0..3 {
            assert!(limiter.can_admit());
            limiter.record_admission();
        }

        advance(Duration::from_millis(1)).await;
        assert!(!limiter.can_admit());

        advance(Duration::from_millis(60_000)).await;
        assert!(limiter.can_admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_boundary_is_inclusive() {
        let limiter = limiter(3, 60_000);
        for _ in 0..3 {
            limiter.record_admission();
        }

        // t=60000ms: the first admissions are exactly one window old.
        advance(Duration::from_millis(60_000)).await;
        assert!(!limiter.can_admit());
        assert_eq!(limiter.stats().in_window, 3);
        assert_eq!(limiter.wait_time(), Duration::from_millis(1));

        advance(Duration::from_millis(1)).await;
        assert!(limiter.can_admit());
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_tracks_oldest_timestamp() {
        let limiter = limiter(2, 10_000);
        assert_eq!(limiter.wait_time(), Duration::ZERO);

        limiter.record_admission();
        advance(Duration::from_millis(3_000)).await;
        limiter.record_admission();

        assert_eq!(limiter.wait_time(), Duration::from_millis(7_001));

        advance(Duration::from_millis(7_001)).await;
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit_reports_wait() {
        let limiter = limiter(1, 5_000);

        assert!(limiter.try_admit().is_ok());
        advance(Duration::from_millis(1_000)).await;

        let wait = limiter.try_admit().unwrap_err();
        assert_eq!(wait, Duration::from_millis(4_001));
        assert_eq!(limiter.stats().in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_applies_to_future_checks() {
        let limiter = limiter(1, 60_000);
        limiter.record_admission();
        assert!(!limiter.can_admit());

        limiter.configure(3, Duration::from_secs(60));
        assert!(limiter.can_admit());
        assert_eq!(limiter.stats().in_window, 1);
        assert_eq!(limiter.config().max_requests, 3);

        limiter.configure(2, Duration::from_millis(100));
        advance(Duration::from_millis(101)).await;
        assert_eq!(limiter.stats().in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_capacity_wait_covers_excess() {
        let limiter = limiter(5, 10_000);
        for _ in 0..4 {
            limiter.record_admission();
            advance(Duration::from_millis(1_000)).await;
        }

        // Four admissions at t=0,1,2,3s; capacity cut to two means the
        // third-oldest has to expire before anything is admitted.
        limiter.configure(2, Duration::from_secs(10));
        assert_eq!(limiter.wait_time(), Duration::from_millis(8_001));
    }

    #[test]
    fn test_zero_capacity_denies() {
        let limiter = limiter(0, 1_000);
        assert!(!limiter.can_admit());
        assert_eq!(limiter.wait_time(), Duration::from_millis(1_000));
        assert!(limiter.try_admit().is_err());
    }

    #[test]
    fn test_stats() {
        let limiter = limiter(4, 60_000);
        limiter.record_admission();

        let stats = limiter.stats();
        assert_eq!(stats.in_window, 1);
        assert_eq!(stats.remaining(), 3);
        assert!((stats.utilization() - 25.0).abs() < 0.1);

        limiter.reset();
        assert_eq!(limiter.stats().in_window, 0);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_capacity() {
        let limiter = Arc::new(limiter(25, 60_000));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.try_admit().is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task joined") {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 25);
    }
}
