//! Structured logging configuration.
//!
//! Provides configurable logging with:
//! - JSON, pretty or compact format
//! - Log level filtering with extra per-target directives
//! - Optional span enter/exit events

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include timestamps
    pub timestamps: bool,
    /// Include source location
    pub include_location: bool,
    /// Include span events
    pub span_events: SpanEvents,
    /// Filter directives (e.g., "reqwest=warn,relay_resilience=debug")
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Compact,
            timestamps: true,
            include_location: false,
            span_events: SpanEvents::None,
            filter: None,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set the output format
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable JSON format
    #[must_use]
    pub fn json(self) -> Self {
        self.with_format(LogFormat::Json)
    }

    /// Set span events
    #[must_use]
    pub fn with_span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    /// Set filter directives
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Get the tracing Level
    #[must_use]
    pub fn tracing_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (structured)
    Json,
    /// Pretty format (human-readable, multi-line)
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

/// Span event configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanEvents {
    /// No span events
    #[default]
    None,
    /// Log when spans are entered
    Enter,
    /// Log when spans are exited
    Exit,
    /// Log both enter and exit
    Full,
    /// Log when spans are created and closed
    Lifecycle,
}

impl SpanEvents {
    fn to_fmt_span(self) -> FmtSpan {
        match self {
            Self::None => FmtSpan::NONE,
            Self::Enter => FmtSpan::ENTER,
            Self::Exit => FmtSpan::EXIT,
            Self::Full => FmtSpan::ENTER | FmtSpan::EXIT,
            Self::Lifecycle => FmtSpan::NEW | FmtSpan::CLOSE,
        }
    }
}

/// Initialize the global subscriber with the given configuration
///
/// # Errors
/// Returns error if the filter does not parse or a global subscriber is
/// already installed
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    if !config.enabled {
        return Ok(());
    }

    let filter = build_filter(config)?;
    let span_events = config.span_events.to_fmt_span();

    let layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty if config.timestamps => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .without_time()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Compact if config.timestamps => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .without_time()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

/// `RUST_LOG` wins over the configured level; extra directives are appended
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Some(ref directives) = config.filter {
        return EnvFilter::try_new(format!("{},{}", config.level, directives))
            .map_err(|e| LoggingError::FilterParse(e.to_string()));
    }

    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::FilterParse(e.to_string())),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    Init(String),
    /// Failed to parse filter
    #[error("Failed to parse log filter: {0}")]
    FilterParse(String),
}
