//! # Relay Configuration
//!
//! Configuration management for the inference relay, including:
//! - Configuration schema and validation
//! - Loading from YAML/TOML/JSON files with environment substitution
//! - `RELAY_*` environment overrides
//! - Hot reload via file watching

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod hot_reload;
pub mod loader;
pub mod schema;

pub use hot_reload::ConfigWatcher;
pub use loader::{load_config, substitute_env_vars, ConfigError, ConfigLoader, ConfigSource, DEFAULT_ENV_PREFIX};
pub use schema::{
    CacheSettings, EndpointsConfig, ObservabilityConfig, RateLimitConfig, RelayConfig,
    ResilienceConfig, RetryConfig, TimeoutSettings,
};
