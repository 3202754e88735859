//! Prometheus metrics for the relay.
//!
//! Provides metrics for:
//! - Call outcomes, attempts and latency per endpoint
//! - Retries and local rate-limit rejections
//! - Cache lookups, evictions and invalidations

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const NAMESPACE: &str = "relay";

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
    /// Histogram buckets for call latency, in seconds
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_buckets: vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ],
        }
    }
}

/// Metrics for a single finished call
#[derive(Debug, Clone)]
pub struct CallMetrics<'a> {
    /// Endpoint name (`inference`, `transcription`)
    pub endpoint: &'a str,
    /// Whether the call returned a value
    pub success: bool,
    /// Whether the call ended by cancellation
    pub cancelled: bool,
    /// Attempts actually sent
    pub attempts: u32,
    /// Error code of the terminal error, if any
    pub error_code: Option<&'a str>,
    /// Whether the local limiter refused the call before any attempt
    pub locally_limited: bool,
    /// Wall time from entry to outcome
    pub duration: Duration,
}

impl CallMetrics<'_> {
    /// Outcome label
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        if self.success {
            "success"
        } else if self.cancelled {
            "cancelled"
        } else {
            "error"
        }
    }
}

/// Relay metrics registry and collectors
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    calls_total: CounterVec,
    call_errors_total: CounterVec,
    retries_total: CounterVec,
    call_attempts: HistogramVec,
    call_duration: HistogramVec,
    rate_limit_rejections: IntCounter,
    cache_lookups: CounterVec,
    cache_evictions: CounterVec,
    cache_invalidations: CounterVec,
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics").finish_non_exhaustive()
    }
}

impl RelayMetrics {
    /// Create a new metrics instance with its own registry
    ///
    /// # Errors
    /// Returns error if metrics cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new(), config)
    }

    /// Create a metrics instance registered into an existing registry
    ///
    /// # Errors
    /// Returns error if any collector is already registered
    pub fn with_registry(registry: Registry, config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let calls_total = CounterVec::new(
            Opts::new("calls_total", "Total number of finished calls").namespace(NAMESPACE),
            &["endpoint", "outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let call_errors_total = CounterVec::new(
            Opts::new("call_errors_total", "Failed calls by error code").namespace(NAMESPACE),
            &["endpoint", "error_code"],
        )?;
        registry.register(Box::new(call_errors_total.clone()))?;

        let retries_total = CounterVec::new(
            Opts::new("retries_total", "Attempts beyond the first").namespace(NAMESPACE),
            &["endpoint"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let call_attempts = HistogramVec::new(
            HistogramOpts::new("call_attempts", "Attempts sent per call")
                .namespace(NAMESPACE)
                .buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 6.0, 11.0]),
            &["endpoint"],
        )?;
        registry.register(Box::new(call_attempts.clone()))?;

        let call_duration = HistogramVec::new(
            HistogramOpts::new("call_duration_seconds", "Call latency in seconds")
                .namespace(NAMESPACE)
                .buckets(config.latency_buckets.clone()),
            &["endpoint"],
        )?;
        registry.register(Box::new(call_duration.clone()))?;

        let rate_limit_rejections = IntCounter::with_opts(
            Opts::new(
                "rate_limit_rejections_total",
                "Calls refused by the local rate limiter",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;

        let cache_lookups = CounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by result").namespace(NAMESPACE),
            &["cache", "result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        let cache_evictions = CounterVec::new(
            Opts::new("cache_evictions_total", "Entries evicted for capacity").namespace(NAMESPACE),
            &["cache"],
        )?;
        registry.register(Box::new(cache_evictions.clone()))?;

        let cache_invalidations = CounterVec::new(
            Opts::new("cache_invalidations_total", "Whole-cache invalidations").namespace(NAMESPACE),
            &["cache"],
        )?;
        registry.register(Box::new(cache_invalidations.clone()))?;

        info!("Metrics initialized");

        Ok(Self {
            registry,
            calls_total,
            call_errors_total,
            retries_total,
            call_attempts,
            call_duration,
            rate_limit_rejections,
            cache_lookups,
            cache_evictions,
            cache_invalidations,
        })
    }

    /// Record a finished call
    pub fn record_call(&self, call: &CallMetrics<'_>) {
        let endpoint = call.endpoint;

        self.calls_total
            .with_label_values(&[endpoint, call.outcome()])
            .inc();
        self.call_attempts
            .with_label_values(&[endpoint])
            .observe(f64::from(call.attempts));
        self.call_duration
            .with_label_values(&[endpoint])
            .observe(call.duration.as_secs_f64());

        if call.attempts > 1 {
            self.retries_total
                .with_label_values(&[endpoint])
                .inc_by(f64::from(call.attempts - 1));
        }
        if call.locally_limited {
            self.rate_limit_rejections.inc();
        }
        if let (false, false, Some(code)) = (call.success, call.cancelled, call.error_code) {
            self.call_errors_total
                .with_label_values(&[endpoint, code])
                .inc();
        }

        debug!(
            endpoint,
            outcome = call.outcome(),
            attempts = call.attempts,
            latency_ms = call.duration.as_millis() as u64,
            "Call metrics recorded"
        );
    }

    /// Record a cache lookup (`hit`, `miss`, `expired`, `stale`)
    pub fn record_cache_lookup(&self, cache: &str, result: &str) {
        self.cache_lookups.with_label_values(&[cache, result]).inc();
    }

    /// Record a capacity eviction
    pub fn record_cache_eviction(&self, cache: &str) {
        self.cache_evictions.with_label_values(&[cache]).inc();
    }

    /// Record a whole-cache invalidation
    pub fn record_cache_invalidation(&self, cache: &str) {
        self.cache_invalidations.with_label_values(&[cache]).inc();
    }

    /// Calls refused by the local limiter so far
    #[must_use]
    pub fn rate_limit_rejections(&self) -> u64 {
        self.rate_limit_rejections.get()
    }

    /// Get metrics as Prometheus text format
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
