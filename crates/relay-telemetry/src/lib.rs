//! # Relay Telemetry
//!
//! Observability for the inference relay:
//! - Structured logging via `tracing`
//! - Prometheus metrics for calls, retries and caches

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingError, SpanEvents};
pub use metrics::{CallMetrics, MetricsConfig, RelayMetrics};
