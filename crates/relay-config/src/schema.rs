//! Configuration schema definitions.
//!
//! This module defines all configuration types with validation and defaults.

use relay_resilience::{BackoffPolicy, CacheConfig, EngineConfig, RateLimiterConfig, TimeoutConfig};
use relay_telemetry::{LoggingConfig, MetricsConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RelayConfig {
    /// Remote endpoint configuration
    #[validate(nested)]
    pub endpoints: EndpointsConfig,

    /// Resilience configuration
    #[validate(nested)]
    pub resilience: ResilienceConfig,

    /// Read-through cache defaults
    #[validate(nested)]
    pub cache: CacheSettings,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

impl RelayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()
    }

    /// Request engine settings derived from the resilience section
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let resilience = &self.resilience;
        EngineConfig {
            max_retries: resilience.retry.max_retries,
            attempt_timeout: resilience.timeout.inference,
            backoff: BackoffPolicy {
                base_delay: resilience.retry.base_delay,
                max_delay: resilience.retry.max_delay,
                max_jitter: resilience.retry.jitter,
            },
            wait_for_admission: resilience.rate_limit.wait_for_admission,
        }
    }

    /// Rate limiter settings
    #[must_use]
    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_requests: self.resilience.rate_limit.max_requests,
            window: self.resilience.rate_limit.window,
        }
    }

    /// Per-endpoint attempt timeouts
    #[must_use]
    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            inference: self.resilience.timeout.inference,
            transcription: self.resilience.timeout.transcription,
        }
    }

    /// Default settings for caches created by the relay
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            ttl: self.cache.ttl,
            debounce: self.cache.debounce,
        }
    }
}

/// Remote endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EndpointsConfig {
    /// API base URL
    #[validate(url)]
    pub base_url: String,

    /// Chat completion path
    #[validate(length(min = 1))]
    pub chat_path: String,

    /// Transcription path
    #[validate(length(min = 1))]
    pub transcription_path: String,

    /// Default chat model
    #[validate(length(min = 1, max = 128))]
    pub inference_model: String,

    /// Default transcription model
    #[validate(length(min = 1, max = 128))]
    pub transcription_model: String,

    /// Default completion budget
    #[validate(range(min = 1, max = 128_000))]
    pub max_tokens: u32,

    /// Default sampling temperature
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,

    /// Organization header value, if any
    pub organization: Option<String>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            chat_path: "/v1/chat/completions".to_string(),
            transcription_path: "/v1/audio/transcriptions".to_string(),
            inference_model: "gpt-4o-mini".to_string(),
            transcription_model: "whisper-1".to_string(),
            max_tokens: 2000,
            temperature: 0.7,
            organization: None,
        }
    }
}

/// Resilience configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry configuration
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Per-attempt timeouts
    #[validate(nested)]
    pub timeout: TimeoutSettings,

    /// Outbound rate limit
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_retry_delays"))]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on a single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Upper bound on the random jitter
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(1000),
        }
    }
}

fn validate_retry_delays(retry: &RetryConfig) -> Result<(), ValidationError> {
    if retry.base_delay.is_zero() {
        return Err(ValidationError::new("base_delay_zero"));
    }
    if retry.max_delay < retry.base_delay {
        return Err(ValidationError::new("max_delay_below_base_delay"));
    }
    Ok(())
}

/// Per-attempt timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_timeouts"))]
pub struct TimeoutSettings {
    /// Chat completion attempt timeout
    #[serde(with = "humantime_serde")]
    pub inference: Duration,

    /// Transcription upload attempt timeout
    #[serde(with = "humantime_serde")]
    pub transcription: Duration,

    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            inference: Duration::from_secs(60),
            transcription: Duration::from_secs(120),
            connect: Duration::from_secs(10),
        }
    }
}

fn validate_timeouts(timeouts: &TimeoutSettings) -> Result<(), ValidationError> {
    if timeouts.inference.is_zero() || timeouts.transcription.is_zero() || timeouts.connect.is_zero() {
        return Err(ValidationError::new("timeout_zero"));
    }
    Ok(())
}

/// Outbound rate limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_rate_limit_window"))]
pub struct RateLimitConfig {
    /// Admissions allowed per window
    #[validate(range(min = 1, max = 100_000))]
    pub max_requests: u32,

    /// Trailing window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Wait for a slot instead of failing fast
    pub wait_for_admission: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            wait_for_admission: false,
        }
    }
}

fn validate_rate_limit_window(limit: &RateLimitConfig) -> Result<(), ValidationError> {
    if limit.window.is_zero() {
        return Err(ValidationError::new("window_zero"));
    }
    Ok(())
}

/// Read-through cache defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum entries per cache
    #[validate(range(min = 1, max = 1_000_000))]
    pub capacity: usize,

    /// Entry lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Quiet period before a change notification invalidates
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(60),
            debounce: Duration::from_millis(500),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}
