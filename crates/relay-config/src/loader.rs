//! Configuration loading from files and environment.
//!
//! Sources are parsed into JSON values and deep-merged in order, so a later
//! source only overrides the keys it actually sets. `${VAR}` and
//! `${VAR:-default}` are substituted in file contents before parsing.

use crate::schema::RelayConfig;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Default prefix for environment overrides
pub const DEFAULT_ENV_PREFIX: &str = "RELAY";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// The path to the file that was not found
        path: String,
    },

    /// IO error
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Unsupported format
    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat {
        /// The file extension that was not supported
        extension: String,
    },

    /// Environment override could not be parsed
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnvValue {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
    },

    /// File watching failed
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    /// File watching needs a tokio runtime to run reloads on
    #[error("Configuration file watching requires a tokio runtime")]
    NoRuntime,
}

/// Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path; format chosen by extension
    File(PathBuf),
    /// Raw YAML string
    Yaml(String),
    /// Raw TOML string
    Toml(String),
    /// Raw JSON string
    Json(String),
    /// Default configuration
    Default,
}

/// Configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration source
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Set environment variable prefix for overrides
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Load configuration from all sources
    ///
    /// # Errors
    /// Returns error if any source fails to load, an override does not
    /// parse, or the merged result fails validation
    pub async fn load(self) -> Result<RelayConfig, ConfigError> {
        let mut merged = serde_json::to_value(RelayConfig::default())?;

        for source in &self.sources {
            let overlay = Self::load_source(source).await?;
            merge_values(&mut merged, overlay);
        }

        let mut config: RelayConfig = serde_json::from_value(merged)?;

        if let Some(ref prefix) = self.env_prefix {
            apply_env_overrides(&mut config, prefix, |name| std::env::var(name).ok())?;
        }

        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!(sources = self.sources.len(), "Configuration loaded successfully");
        Ok(config)
    }

    async fn load_source(source: &ConfigSource) -> Result<Value, ConfigError> {
        match source {
            ConfigSource::File(path) => Self::load_file(path).await,
            ConfigSource::Yaml(content) => parse_yaml(content),
            ConfigSource::Toml(content) => parse_toml(content),
            ConfigSource::Json(content) => Ok(serde_json::from_str(content)?),
            ConfigSource::Default => Ok(serde_json::to_value(RelayConfig::default())?),
        }
    }

    async fn load_file(path: &Path) -> Result<Value, ConfigError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).await?;
        let content = substitute_env_vars(&content);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension.as_str() {
            "yaml" | "yml" => parse_yaml(&content),
            "toml" => parse_toml(&content),
            "json" => Ok(serde_json::from_str(&content)?),
            ext => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }
}

fn parse_yaml(content: &str) -> Result<Value, ConfigError> {
    // An empty YAML document is null; treat it as "no overrides".
    let value: Value = serde_yaml::from_str(content)?;
    Ok(if value.is_null() { Value::Object(Map::new()) } else { value })
}

fn parse_toml(content: &str) -> Result<Value, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Recursively merge `overlay` into `base`; non-object values replace
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[allow(clippy::expect_used)]
fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
    })
}

/// Substitute `${VAR}` and `${VAR:-default}` references
///
/// Unset variables without a default are left in place and logged.
#[must_use]
pub fn substitute_env_vars(content: &str) -> String {
    substitute_with(content, |name| std::env::var(name).ok())
}

fn substitute_with(content: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    env_pattern()
        .replace_all(content, |caps: &Captures<'_>| {
            let name = &caps[1];
            match (lookup(name), caps.get(2)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => {
                    warn!(variable = name, "Environment variable not found");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn parse_env<T: FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvValue {
            name: name.to_string(),
            value,
        })
}

/// Apply `<PREFIX>_*` overrides on top of the merged configuration
fn apply_env_overrides(
    config: &mut RelayConfig,
    prefix: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |suffix: &str| {
        let name = format!("{prefix}_{suffix}");
        lookup(&name).map(|value| (name, value))
    };

    if let Some((_, value)) = var("BASE_URL") {
        config.endpoints.base_url = value;
    }
    if let Some((name, value)) = var("MAX_RETRIES") {
        config.resilience.retry.max_retries = parse_env(&name, value)?;
    }
    if let Some((name, value)) = var("RATE_LIMIT_MAX_REQUESTS") {
        config.resilience.rate_limit.max_requests = parse_env(&name, value)?;
    }
    if let Some((name, value)) = var("RATE_LIMIT_WINDOW_SECS") {
        config.resilience.rate_limit.window = Duration::from_secs(parse_env(&name, value)?);
    }
    if let Some((name, value)) = var("CACHE_TTL_SECS") {
        config.cache.ttl = Duration::from_secs(parse_env(&name, value)?);
    }
    if let Some((_, value)) = var("LOG_LEVEL") {
        config.observability.logging.level = value;
    }
    if let Some((name, value)) = var("METRICS_ENABLED") {
        config.observability.metrics.enabled = parse_env(&name, value)?;
    }

    Ok(())
}

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from `RELAY_CONFIG` environment variable
/// 2. ./relay.yaml, ./relay.toml
/// 3. ./config/relay.yaml
///
/// `RELAY_*` overrides apply in every case.
///
/// # Errors
/// Returns error if parsing or validation fails
pub async fn load_config() -> Result<RelayConfig, ConfigError> {
    let search_paths: Vec<PathBuf> = match std::env::var("RELAY_CONFIG") {
        Ok(path) => vec![PathBuf::from(path)],
        Err(_) => ["relay.yaml", "relay.yml", "relay.toml", "config/relay.yaml"]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
    };

    let loader = ConfigLoader::new().with_env_prefix(DEFAULT_ENV_PREFIX);
    for path in search_paths {
        if fs::try_exists(&path).await.unwrap_or(false) {
            info!(path = %path.display(), "Loading configuration");
            return loader.with_file(path).load().await;
        }
    }

    warn!("No configuration file found, using defaults");
    loader.load().await
}
