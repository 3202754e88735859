//! # Relay Core
//!
//! Shared building blocks for the inference relay:
//! - Error taxonomy and status classification
//! - Cooperative cancellation tokens
//! - The transport seam used by endpoint clients
//! - Validated request and response types

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancellation;
pub mod error;
pub mod transport;
pub mod types;

pub use cancellation::CancellationToken;
pub use error::{extract_error_message, RateLimitOrigin, RelayError, RelayResult};
pub use transport::{
    FormPart, Method, MultipartForm, PartValue, RequestBody, Transport, TransportRequest,
    TransportResponse,
};
pub use types::{
    ApiKey, Credentials, InferenceResponse, LanguageHint, MaxTokens, ModelName, ModelParams,
    Temperature, TranscriptionResponse, ValidationError,
};
