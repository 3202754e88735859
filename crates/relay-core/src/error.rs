//! Error types and classification for relay calls.
//!
//! Every failure a remote call can end in maps onto one [`RelayError`] kind.
//! The kind decides whether the request engine may retry, and carries enough
//! context to render a single human-readable message for the user.

use http::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using `RelayError`
pub type RelayResult<T> = Result<T, RelayError>;

/// Maximum number of characters of a raw error body surfaced to users
pub const MAX_RAW_ERROR_CHARS: usize = 200;

/// Where a rate limit decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOrigin {
    /// Denied by the local sliding-window limiter before any request was sent
    Local,
    /// The remote API answered 429
    Remote,
}

/// Failure taxonomy for remote calls
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// The operation was cancelled through its token
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Reason given to the first `cancel` call
        reason: String,
    },

    /// Local admission denied or remote 429
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Suggested wait before the next attempt
        retry_after: Option<Duration>,
        /// Local limiter or remote API
        origin: RateLimitOrigin,
        /// Message reported by the API, if any
        message: Option<String>,
    },

    /// A single attempt exceeded its timeout
    #[error("Request timeout")]
    Timeout {
        /// The per-attempt timeout that elapsed
        duration: Duration,
    },

    /// Remote 5xx
    #[error("Server unavailable ({status}): {message}")]
    ServerUnavailable {
        /// HTTP status code
        status: u16,
        /// Extracted error message
        message: String,
    },

    /// Remote 401
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Extracted error message
        message: String,
    },

    /// Remote 403
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Extracted error message
        message: String,
    },

    /// A success status with an empty or unparseable payload
    #[error("Malformed response: {message}")]
    MalformedResponse {
        /// What was wrong with the payload
        message: String,
    },

    /// Any other 4xx
    #[error("Client error ({status}): {message}")]
    ClientError {
        /// HTTP status code
        status: u16,
        /// Extracted error message
        message: String,
    },

    /// Transport failure that is not a timeout (DNS, TLS, connection reset)
    #[error("Transport error: {message}")]
    Transport {
        /// Transport-level description
        message: String,
    },

    /// Invalid local configuration or request parameters
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },
}

impl RelayError {
    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::ServerUnavailable { .. }
        )
    }

    /// Check if this error represents cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// HTTP status associated with this error, if it came from the remote API
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited {
                origin: RateLimitOrigin::Remote,
                ..
            } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            Self::ServerUnavailable { status, .. } | Self::ClientError { status, .. } => {
                Some(*status)
            }
            Self::AuthenticationFailed { .. } => Some(StatusCode::UNAUTHORIZED.as_u16()),
            Self::PermissionDenied { .. } => Some(StatusCode::FORBIDDEN.as_u16()),
            _ => None,
        }
    }

    /// Stable error code for logs and metrics labels
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Cancelled { .. } => "cancelled",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::ServerUnavailable { .. } => "server_unavailable",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::ClientError { .. } => "client_error",
            Self::Transport { .. } => "transport_error",
            Self::Configuration { .. } => "configuration_error",
        }
    }

    /// Human-readable message, enriched with guidance per status class
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled { reason } => format!("Request cancelled: {reason}"),
            Self::RateLimited {
                retry_after,
                origin: RateLimitOrigin::Local,
                ..
            } => {
                let secs = retry_after.map_or(1, |d| d.as_secs_f64().ceil().max(1.0) as u64);
                format!("Rate limit exceeded. Please wait {secs} seconds before trying again.")
            }
            Self::RateLimited { message, .. } => match message {
                Some(msg) => format!(
                    "Rate limit exceeded by the API: {msg}. Please wait a moment and try again."
                ),
                None => "Rate limit exceeded by the API. Please wait a moment and try again."
                    .to_string(),
            },
            Self::Timeout { duration } => format!(
                "Request timeout. The API did not respond within {} seconds.",
                duration.as_secs()
            ),
            Self::ServerUnavailable { status, message } => format!(
                "The API service is temporarily unavailable (HTTP {status}): {message}. Please try again later."
            ),
            Self::AuthenticationFailed { message } => format!(
                "Authentication failed: {message}. Please check your API key in settings."
            ),
            Self::PermissionDenied { message } => format!(
                "Permission denied: {message}. Your API key may not have access to this model."
            ),
            Self::MalformedResponse { message } => format!("Invalid response from API: {message}"),
            Self::ClientError { status, message } => {
                format!("Request rejected (HTTP {status}): {message}")
            }
            Self::Transport { message } => {
                format!("Network error: {message}. Please check your connection.")
            }
            Self::Configuration { message } => format!("Configuration error: {message}"),
        }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a local rate limit error
    #[must_use]
    pub fn rate_limited_locally(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after: Some(retry_after),
            origin: RateLimitOrigin::Local,
            message: None,
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a malformed response error
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Create a transport error
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP response
    ///
    /// `body` is the raw response body; its `{error:{message}}` field is used
    /// when present, otherwise a truncated copy of the body.
    #[must_use]
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = extract_error_message(body);
        match status {
            401 => Self::AuthenticationFailed { message },
            403 => Self::PermissionDenied { message },
            429 => Self::RateLimited {
                retry_after,
                origin: RateLimitOrigin::Remote,
                message: Some(message),
            },
            500..=599 => Self::ServerUnavailable { status, message },
            _ => Self::ClientError { status, message },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Pull a readable message out of an API error body
///
/// OpenAI-style bodies (`{"error":{"message":"..."}}`) yield their message;
/// anything else is returned raw, truncated to [`MAX_RAW_ERROR_CHARS`].
#[must_use]
pub fn extract_error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(body) {
        return envelope.error.message;
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no error details returned".to_string();
    }

    match trimmed.char_indices().nth(MAX_RAW_ERROR_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            RelayError::from_status(401, "", None),
            RelayError::AuthenticationFailed { .. }
        ));
        assert!(matches!(
            RelayError::from_status(403, "", None),
            RelayError::PermissionDenied { .. }
        ));
        assert!(matches!(
            RelayError::from_status(429, "", None),
            RelayError::RateLimited {
                origin: RateLimitOrigin::Remote,
                ..
            }
        ));
        assert!(matches!(
            RelayError::from_status(503, "", None),
            RelayError::ServerUnavailable { status: 503, .. }
        ));
        assert!(matches!(
            RelayError::from_status(404, "", None),
            RelayError::ClientError { status: 404, .. }
        ));
    }

    #[test]
    fn test_error_retryability() {
        assert!(RelayError::from_status(429, "", None).is_retryable());
        assert!(RelayError::from_status(500, "", None).is_retryable());
        assert!(RelayError::from_status(599, "", None).is_retryable());
        assert!(RelayError::timeout(Duration::from_secs(60)).is_retryable());
        assert!(RelayError::rate_limited_locally(Duration::from_secs(1)).is_retryable());

        assert!(!RelayError::from_status(400, "", None).is_retryable());
        assert!(!RelayError::from_status(401, "", None).is_retryable());
        assert!(!RelayError::from_status(403, "", None).is_retryable());
        assert!(!RelayError::malformed("empty").is_retryable());
        assert!(!RelayError::transport("connection reset").is_retryable());
        assert!(!RelayError::cancelled("user").is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(
            RelayError::timeout(Duration::from_secs(60)).to_string(),
            "Request timeout"
        );
    }

    #[test]
    fn test_extract_structured_message() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(extract_error_message(body), "Incorrect API key provided");
    }

    #[test]
    fn test_extract_raw_message_truncated() {
        let body = "x".repeat(500);
        let message = extract_error_message(&body);
        assert_eq!(message.len(), MAX_RAW_ERROR_CHARS + 3);
        assert!(message.ends_with("..."));

        assert_eq!(extract_error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(extract_error_message("   "), "no error details returned");
    }

    #[test]
    fn test_extract_multibyte_body_truncates_on_char_boundary() {
        let body = "é".repeat(300);
        let message = extract_error_message(&body);
        assert_eq!(message.chars().count(), MAX_RAW_ERROR_CHARS + 3);
    }

    #[test]
    fn test_user_messages_per_class() {
        let auth = RelayError::from_status(401, r#"{"error":{"message":"bad key"}}"#, None);
        assert_eq!(
            auth.user_message(),
            "Authentication failed: bad key. Please check your API key in settings."
        );

        let local = RelayError::rate_limited_locally(Duration::from_millis(2500));
        assert_eq!(
            local.user_message(),
            "Rate limit exceeded. Please wait 3 seconds before trying again."
        );

        let server = RelayError::from_status(502, "upstream down", None);
        assert!(server.user_message().contains("HTTP 502"));
        assert!(server.user_message().contains("upstream down"));
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(RelayError::from_status(401, "", None).status_code(), Some(401));
        assert_eq!(RelayError::from_status(429, "", None).status_code(), Some(429));
        assert_eq!(
            RelayError::rate_limited_locally(Duration::from_secs(1)).status_code(),
            None
        );
        assert_eq!(RelayError::timeout(Duration::from_secs(1)).status_code(), None);
    }
}
