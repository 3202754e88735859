//! Transport seam between the relay and the network.
//!
//! The request engine never talks HTTP directly. Endpoint clients build a
//! [`TransportRequest`] and hand it to a [`Transport`], which returns the raw
//! status and body. Tests substitute scripted transports; production uses the
//! reqwest-backed implementation in `relay-providers`.

use crate::cancellation::CancellationToken;
use crate::error::RelayError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Sends one HTTP request and returns the raw response
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request
    ///
    /// When `abort` is given, the implementation must stop the in-flight
    /// request as soon as the token is cancelled and return
    /// `RelayError::Cancelled`.
    ///
    /// # Errors
    /// Returns `RelayError::Timeout` for transport-level timeouts,
    /// `RelayError::Cancelled` when aborted, and `RelayError::Transport` for
    /// any other network failure. Non-2xx statuses are not errors here.
    async fn send(
        &self,
        request: TransportRequest,
        abort: Option<&CancellationToken>,
    ) -> Result<TransportResponse, RelayError>;
}

/// HTTP method used by relay endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

/// An outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Request headers (credentials included)
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: RequestBody,
}

impl TransportRequest {
    /// Create a POST request with a JSON body
    #[must_use]
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    /// Create a POST request with a multipart body
    #[must_use]
    pub fn post_multipart(url: impl Into<String>, form: MultipartForm) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Multipart(form),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request body variants
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// No body
    Empty,
    /// JSON document
    Json(serde_json::Value),
    /// `multipart/form-data`
    Multipart(MultipartForm),
}

/// A `multipart/form-data` body
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    /// Parts in submission order
    pub parts: Vec<FormPart>,
}

impl MultipartForm {
    /// Create an empty form
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a text field
    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart {
            name: name.into(),
            value: PartValue::Text(value.into()),
        });
        self
    }

    /// Add a binary file field
    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.parts.push(FormPart {
            name: name.into(),
            value: PartValue::File {
                file_name: file_name.into(),
                mime_type: mime_type.into(),
                bytes,
            },
        });
        self
    }

    /// Find a part by field name
    #[must_use]
    pub fn part(&self, name: &str) -> Option<&FormPart> {
        self.parts.iter().find(|p| p.name == name)
    }
}

/// One field of a multipart form
#[derive(Debug, Clone)]
pub struct FormPart {
    /// Field name
    pub name: String,
    /// Field value
    pub value: PartValue,
}

/// Multipart field value
#[derive(Clone)]
pub enum PartValue {
    /// Plain text
    Text(String),
    /// Binary file
    File {
        /// File name sent in the content disposition
        file_name: String,
        /// MIME type of the payload
        mime_type: String,
        /// Raw bytes
        bytes: Vec<u8>,
    },
}

impl PartValue {
    /// Text content, if this is a text part
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::File { .. } => None,
        }
    }
}

impl fmt::Debug for PartValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::File {
                file_name,
                mime_type,
                bytes,
            } => f
                .debug_struct("File")
                .field("file_name", file_name)
                .field("mime_type", mime_type)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// Raw response returned by a transport
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
    /// Parsed `Retry-After` header, if the server sent one
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    /// Create a response with the given status and body
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// Set the retry-after hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert a non-2xx response into its classified error
    ///
    /// # Errors
    /// Returns the `RelayError` matching the status class
    pub fn error_for_status(self) -> Result<Self, RelayError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RelayError::from_status(self.status, &self.body, self.retry_after))
        }
    }
}
