//! reqwest-backed [`Transport`].

use async_trait::async_trait;
use http::header::{HeaderMap, RETRY_AFTER};
use relay_core::{
    CancellationToken, Method, PartValue, RelayError, RequestBody, Transport, TransportRequest,
    TransportResponse,
};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, trace};

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Hard ceiling on a single exchange; attempt timeouts are normally shorter
    pub request_timeout: Duration,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            pool_max_idle_per_host: 8,
            user_agent: concat!("inference-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Production transport over reqwest
pub struct ReqwestTransport {
    client: Client,
    config: HttpClientConfig,
}

impl ReqwestTransport {
    /// Create a new transport
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created
    pub fn new(config: HttpClientConfig) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RelayError::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Create with default configuration
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created
    pub fn with_defaults() -> Result<Self, RelayError> {
        Self::new(HttpClientConfig::default())
    }

    fn build(&self, request: TransportRequest) -> Result<reqwest::RequestBuilder, RelayError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(form) => {
                let mut multipart = Form::new();
                for part in form.parts {
                    multipart = match part.value {
                        PartValue::Text(text) => multipart.text(part.name, text),
                        PartValue::File {
                            file_name,
                            mime_type,
                            bytes,
                        } => {
                            let file = Part::bytes(bytes)
                                .file_name(file_name)
                                .mime_str(&mime_type)
                                .map_err(|e| {
                                    RelayError::configuration(format!(
                                        "Invalid MIME type '{mime_type}': {e}"
                                    ))
                                })?;
                            multipart.part(part.name, file)
                        }
                    };
                }
                builder.multipart(multipart)
            }
        };

        Ok(builder)
    }

    async fn dispatch(&self, request: TransportRequest) -> Result<TransportResponse, RelayError> {
        let url = request.url.clone();
        let builder = self.build(request)?;

        trace!(url = %url, "Sending HTTP request");
        let response = builder.send().await.map_err(|e| self.map_error(&e))?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(|e| self.map_error(&e))?;

        debug!(url = %url, status, body_len = body.len(), "HTTP response received");

        Ok(TransportResponse {
            status,
            body,
            retry_after,
        })
    }

    fn map_error(&self, e: &reqwest::Error) -> RelayError {
        if e.is_timeout() {
            RelayError::timeout(self.config.request_timeout)
        } else if e.is_connect() {
            RelayError::transport(format!("Connection failed: {e}"))
        } else {
            RelayError::transport(format!("Request failed: {e}"))
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        abort: Option<&CancellationToken>,
    ) -> Result<TransportResponse, RelayError> {
        let Some(token) = abort else {
            return self.dispatch(request).await;
        };

        // Dropping the in-flight future closes the connection.
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!("HTTP request aborted");
                Err(RelayError::cancelled(token.reason().unwrap_or_default()))
            }
            result = self.dispatch(request) => result,
        }
    }
}

/// Parse a delay-seconds `Retry-After` header
///
/// HTTP-date values are ignored.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
