//! # Relay
//!
//! Resilient client-side access to a rate-limited inference API.
//!
//! [`Relay`] wires the pieces together:
//! - one sliding-window rate limiter shared by every call
//! - chat-completion and transcription clients driven by the retrying
//!   request engine
//! - read-through caches invalidated by debounced document changes
//! - last-wins operation slots for user-triggered calls
//! - hot-reloadable configuration, structured logging and metrics
//!
//! ```no_run
//! use relay::{InferenceCall, Relay};
//!
//! # async fn run() -> Result<(), relay::RelayError> {
//! let relay = Relay::builder().build()?;
//! let credentials = relay.credentials("sk-...")?;
//! let params = relay.default_model_params()?;
//!
//! let token = relay.slots().begin("summarize");
//! let response = relay
//!     .call_remote_inference(
//!         InferenceCall::new("Summarize this", "You are terse.", &credentials, &params)
//!             .with_token(&token),
//!     )
//!     .await;
//! relay.slots().finish("summarize", &token);
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod runtime;
pub mod slots;
pub mod watch;

pub use runtime::{Relay, RelayBuilder, SHUTDOWN_REASON};
pub use slots::{OperationSlots, SUPERSEDED_REASON};
pub use watch::{document_events, ChangeListener, DocumentEvent, DocumentWatcher};

pub use relay_config::{ConfigLoader, ConfigSource, ConfigWatcher, RelayConfig};
pub use relay_core::{
    CancellationToken, Credentials, InferenceResponse, LanguageHint, ModelName, ModelParams,
    RelayError, RelayResult, Transport, TranscriptionResponse,
};
pub use relay_providers::{InferenceCall, TranscriptionCall};
pub use relay_resilience::{CacheConfig, CacheStats, RateLimiter, ReadThroughCache};
pub use relay_telemetry::{init_logging, LoggingConfig, RelayMetrics};
