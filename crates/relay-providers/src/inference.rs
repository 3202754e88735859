//! Chat-completion endpoint client.

use crate::endpoint::{authorize, EndpointConfig};
use relay_core::{
    CancellationToken, Credentials, InferenceResponse, ModelParams, RelayError, Transport,
    TransportRequest,
};
use relay_resilience::{CallOptions, CallOutcome, RequestEngine, TimeoutManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One chat-completion call
#[derive(Debug, Clone, Copy)]
pub struct InferenceCall<'a> {
    /// User message
    pub prompt: &'a str,
    /// System message
    pub system_prompt: &'a str,
    /// Credentials sent with every attempt
    pub credentials: &'a Credentials,
    /// Model and sampling parameters
    pub params: &'a ModelParams,
    /// Cancellation observed at every wait point
    pub token: Option<&'a CancellationToken>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
    /// Retry budget override
    pub max_retries: Option<u32>,
}

impl<'a> InferenceCall<'a> {
    /// Create a call with default timeout and retry budget
    #[must_use]
    pub fn new(
        prompt: &'a str,
        system_prompt: &'a str,
        credentials: &'a Credentials,
        params: &'a ModelParams,
    ) -> Self {
        Self {
            prompt,
            system_prompt,
            credentials,
            params,
            token: None,
            timeout: None,
            max_retries: None,
        }
    }

    /// Observe a cancellation token
    #[must_use]
    pub fn with_token(mut self, token: &'a CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Override the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Client for the chat-completion endpoint
pub struct InferenceClient {
    transport: Arc<dyn Transport>,
    engine: RequestEngine,
    endpoint: EndpointConfig,
    timeouts: TimeoutManager,
}

impl InferenceClient {
    /// Create a new client
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        engine: RequestEngine,
        endpoint: EndpointConfig,
        timeouts: TimeoutManager,
    ) -> Self {
        Self {
            transport,
            engine,
            endpoint,
            timeouts,
        }
    }

    /// Build the HTTP request for one attempt
    ///
    /// # Errors
    /// Returns error if the body cannot be serialized
    pub fn build_request(&self, call: &InferenceCall<'_>) -> Result<TransportRequest, RelayError> {
        let body = ChatCompletionRequest {
            model: call.params.model.as_str(),
            messages: [
                ChatMessage {
                    role: "system",
                    content: call.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: call.prompt,
                },
            ],
            max_tokens: call.params.max_tokens.value(),
            temperature: call.params.temperature.value(),
        };

        let body = serde_json::to_value(&body)
            .map_err(|e| RelayError::configuration(format!("Failed to encode request: {e}")))?;

        Ok(authorize(
            TransportRequest::post_json(self.endpoint.chat_url(), body),
            call.credentials,
        ))
    }

    /// Run the call through the request engine
    pub async fn execute(&self, call: &InferenceCall<'_>) -> CallOutcome<String> {
        let request = match self.build_request(call) {
            Ok(request) => request,
            Err(e) => return CallOutcome::rejected(e),
        };
        let options = CallOptions::new("inference")
            .with_token(call.token)
            .with_timeout(Some(self.timeouts.inference_timeout(call.timeout)))
            .with_max_retries(call.max_retries);

        debug!(
            model = %call.params.model,
            prompt_len = call.prompt.len(),
            "Sending chat completion request"
        );

        self.engine
            .execute(options, |_| {
                let request = request.clone();
                let transport = Arc::clone(&self.transport);
                async move {
                    let response = transport.send(request, None).await?.error_for_status()?;
                    parse_completion(&response.body)
                }
            })
            .await
    }

    /// Call the chat-completion endpoint
    pub async fn call_remote_inference(&self, call: InferenceCall<'_>) -> InferenceResponse {
        inference_response(self.execute(&call).await)
    }
}

/// Flatten an engine outcome into the caller-facing response
#[must_use]
pub fn inference_response(outcome: CallOutcome<String>) -> InferenceResponse {
    InferenceResponse {
        success: outcome.is_success(),
        error_message: outcome.error_message(),
        cancelled: outcome.cancelled,
        attempts: outcome.attempts,
        content: outcome.value,
    }
}

/// Extract `choices[0].message.content` from a 2xx body
///
/// # Errors
/// Returns `RelayError::MalformedResponse` if the body does not parse or the
/// content is missing or blank
pub fn parse_completion(body: &str) -> Result<String, RelayError> {
    let response: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| RelayError::malformed(format!("Failed to parse response: {e}")))?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| RelayError::malformed("Response contained no content"))
}

// Chat completion wire types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}
