//! # Relay Providers
//!
//! Endpoint clients for the remote inference API:
//! - Chat completions (`InferenceClient`)
//! - Audio transcription uploads (`TranscriptionClient`)
//! - The reqwest-backed `Transport`
//! - A scripted transport for tests (`test-util` feature)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod endpoint;
pub mod inference;
pub mod reqwest_transport;
#[cfg(any(feature = "test-util", test))]
pub mod testing;
pub mod transcription;

pub use endpoint::EndpointConfig;
pub use reqwest_transport::{HttpClientConfig, ReqwestTransport};
pub use inference::{inference_response, parse_completion, InferenceCall, InferenceClient};
#[cfg(any(feature = "test-util", test))]
pub use testing::ScriptedTransport;
pub use transcription::{
    parse_transcription, transcription_response, TranscriptionCall, TranscriptionClient,
};
