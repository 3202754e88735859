//! Remote endpoint addressing and request authorization.

use http::header::AUTHORIZATION;
use relay_core::{Credentials, TransportRequest};

/// Header carrying the optional organization id
pub const ORGANIZATION_HEADER: &str = "OpenAI-Organization";

/// Where the remote API lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Base URL (default: https://api.openai.com)
    pub base_url: String,
    /// Chat completions path
    pub chat_path: String,
    /// Audio transcription path
    pub transcription_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            chat_path: "/v1/chat/completions".to_string(),
            transcription_path: "/v1/audio/transcriptions".to_string(),
        }
    }
}

impl EndpointConfig {
    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Chat completions URL
    #[must_use]
    pub fn chat_url(&self) -> String {
        join(&self.base_url, &self.chat_path)
    }

    /// Transcription URL
    #[must_use]
    pub fn transcription_url(&self) -> String {
        join(&self.base_url, &self.transcription_path)
    }
}

fn join(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Attach credential headers
pub(crate) fn authorize(request: TransportRequest, credentials: &Credentials) -> TransportRequest {
    let request = request.with_header(AUTHORIZATION.as_str(), credentials.bearer());
    match &credentials.organization {
        Some(org) => request.with_header(ORGANIZATION_HEADER, org.clone()),
        None => request,
    }
}
