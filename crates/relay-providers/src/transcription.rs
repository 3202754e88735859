//! Audio transcription endpoint client.
//!
//! Uploads are large, so unlike chat completions the cancellation token is
//! also handed to the transport, which aborts the upload mid-flight.

use crate::endpoint::{authorize, EndpointConfig};
use relay_core::{
    CancellationToken, Credentials, LanguageHint, ModelName, MultipartForm, RelayError, Transport,
    TransportRequest, TranscriptionResponse,
};
use relay_resilience::{CallOptions, CallOutcome, RequestEngine, TimeoutManager};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One transcription call
#[derive(Debug, Clone, Copy)]
pub struct TranscriptionCall<'a> {
    /// Encoded audio
    pub audio: &'a [u8],
    /// File name reported in the upload
    pub file_name: &'a str,
    /// MIME type of the audio
    pub mime_type: &'a str,
    /// Credentials sent with every attempt
    pub credentials: &'a Credentials,
    /// Transcription model
    pub model: &'a ModelName,
    /// Spoken language, if known
    pub language: Option<&'a LanguageHint>,
    /// Cancellation observed at every wait point and by the upload itself
    pub token: Option<&'a CancellationToken>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
    /// Retry budget override
    pub max_retries: Option<u32>,
}

impl<'a> TranscriptionCall<'a> {
    /// Create a call for WebM audio with default timeout and retry budget
    #[must_use]
    pub fn new(audio: &'a [u8], credentials: &'a Credentials, model: &'a ModelName) -> Self {
        Self {
            audio,
            file_name: "recording.webm",
            mime_type: "audio/webm",
            credentials,
            model,
            language: None,
            token: None,
            timeout: None,
            max_retries: None,
        }
    }

    /// Set the uploaded file name and MIME type
    #[must_use]
    pub fn with_file(mut self, file_name: &'a str, mime_type: &'a str) -> Self {
        self.file_name = file_name;
        self.mime_type = mime_type;
        self
    }

    /// Set the language hint
    #[must_use]
    pub fn with_language(mut self, language: &'a LanguageHint) -> Self {
        self.language = Some(language);
        self
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

/// Client for the transcription endpoint
pub struct TranscriptionClient {
    transport: Arc<dyn Transport>,
    engine: RequestEngine,
    endpoint: EndpointConfig,
    timeouts: TimeoutManager,
}

impl TranscriptionClient {
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

    /// Build the multipart upload for one attempt
    #[must_use]
    pub fn build_request(&self, call: &TranscriptionCall<'_>) -> TransportRequest {
        let mut form = MultipartForm::new()
            .file("file", call.file_name, call.mime_type, call.audio.to_vec())
            .text("model", call.model.as_str());
        if let Some(language) = call.language {
            form = form.text("language", language.as_str());
        }
        form = form.text("response_format", "json");

        authorize(
            TransportRequest::post_multipart(self.endpoint.transcription_url(), form),
            call.credentials,
        )
    }

    /// Run the call through the request engine
    pub async fn execute(&self, call: &TranscriptionCall<'_>) -> CallOutcome<String> {
        if call.audio.is_empty() {
            return CallOutcome::rejected(RelayError::ClientError {
                status: 400,
                message: "audio payload is empty".to_string(),
            });
        }

        let options = CallOptions::new("transcription")
            .with_token(call.token)
            .with_timeout(Some(self.timeouts.transcription_timeout(call.timeout)))
            .with_max_retries(call.max_retries);

        debug!(
            model = %call.model,
            audio_bytes = call.audio.len(),
            language = call.language.map(LanguageHint::as_str),
            "Uploading audio for transcription"
        );

        let token = call.token;
        self.engine
            .execute(options, |_| {
                let request = self.build_request(call);
                let transport = Arc::clone(&self.transport);
                async move {
                    let response = transport.send(request, token).await?.error_for_status()?;
                    parse_transcription(&response.body)
                }
            })
            .await
    }

    /// Call the transcription endpoint
    pub async fn call_remote_transcription(
        &self,
        call: TranscriptionCall<'_>,
    ) -> TranscriptionResponse {
        transcription_response(self.execute(&call).await)
    }
}

/// Flatten an engine outcome into the caller-facing response
#[must_use]
pub fn transcription_response(outcome: CallOutcome<String>) -> TranscriptionResponse {
    TranscriptionResponse {
        success: outcome.is_success(),
        error_message: outcome.error_message(),
        cancelled: outcome.cancelled,
        attempts: outcome.attempts,
        text: outcome.value,
    }
}

/// Extract `text` from a 2xx transcription body
///
/// # Errors
/// Returns `RelayError::MalformedResponse` if the body does not parse or has
/// no `text` field
pub fn parse_transcription(body: &str) -> Result<String, RelayError> {
    let response: TranscriptionBody = serde_json::from_str(body)
        .map_err(|e| RelayError::malformed(format!("Failed to parse transcription: {e}")))?;
    response
        .text
        .ok_or_else(|| RelayError::malformed("Transcription response has no text"))
}

#[derive(Debug, Deserialize)]
struct TranscriptionBody {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use relay_core::{PartValue, RequestBody};
    use relay_resilience::{EngineConfig, RateLimiter};

    fn client(transport: Arc<ScriptedTransport>) -> TranscriptionClient {
        TranscriptionClient::new(
            transport,
            RequestEngine::new(
                Arc::new(RateLimiter::with_defaults("test")),
                EngineConfig::default(),
            ),
            EndpointConfig::default(),
            TimeoutManager::with_defaults(),
        )
    }

    #[test]
    fn test_parse_transcription() {
        assert_eq!(
            parse_transcription(r#"{"text":"hello world"}"#).expect("text"),
            "hello world"
        );
        // Silence transcribes to an empty string, which is still a success.
        assert_eq!(parse_transcription(r#"{"text":""}"#).expect("text"), "");
        assert!(parse_transcription("{}").is_err());
        assert!(parse_transcription("<html>").is_err());
    }

    #[test]
    fn test_multipart_fields() {
        let client = client(Arc::new(ScriptedTransport::new()));
        let credentials = Credentials::new("sk-test").expect("valid key");
        let model = ModelName::new("whisper-1").expect("valid model");
        let language = LanguageHint::new("DE").expect("valid language");
        let audio = [1u8, 2, 3];

        let request = client.build_request(
            &TranscriptionCall::new(&audio, &credentials, &model)
                .with_file("clip.wav", "audio/wav")
                .with_language(&language),
        );

        assert_eq!(request.url, "https://api.openai.com/v1/audio/transcriptions");
        let RequestBody::Multipart(form) = request.body else {
            panic!("expected multipart body");
        };
        let names: Vec<&str> = form.parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["file", "model", "language", "response_format"]);

        match &form.part("file").expect("file part").value {
            PartValue::File {
                file_name,
                mime_type,
                bytes,
            } => {
                assert_eq!(file_name, "clip.wav");
                assert_eq!(mime_type, "audio/wav");
                assert_eq!(bytes, &vec![1, 2, 3]);
            }
            PartValue::Text(_) => panic!("file part must be binary"),
        }
        assert_eq!(form.part("language").and_then(|p| p.value.as_text()), Some("de"));
        assert_eq!(
            form.part("response_format").and_then(|p| p.value.as_text()),
            Some("json")
        );
    }

    #[test]
    fn test_language_omitted_when_unknown() {
        let client = client(Arc::new(ScriptedTransport::new()));
        let credentials = Credentials::new("sk-test").expect("valid key");
        let model = ModelName::new("whisper-1").expect("valid model");

        let request = client.build_request(&TranscriptionCall::new(&[0u8], &credentials, &model));
        let RequestBody::Multipart(form) = request.body else {
            panic!("expected multipart body");
        };
        assert!(form.part("language").is_none());
    }

    #[tokio::test]
    async fn test_empty_audio_rejected_without_sending() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(Arc::clone(&transport));
        let credentials = Credentials::new("sk-test").expect("valid key");
        let model = ModelName::new("whisper-1").expect("valid model");

        let response = client
            .call_remote_transcription(TranscriptionCall::new(&[], &credentials, &model))
            .await;

        assert!(!response.success);
        assert_eq!(response.attempts, 0);
        assert_eq!(transport.request_count(), 0);
    }
}
