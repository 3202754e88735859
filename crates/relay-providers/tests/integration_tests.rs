//! Integration tests for the endpoint clients.
//!
//! These run the full request path (client, engine, limiter) against a
//! scripted transport with tokio's paused clock.

use relay_core::{
    CancellationToken, Credentials, ModelName, ModelParams, RelayError, TransportResponse,
};
use relay_providers::{
    EndpointConfig, InferenceCall, InferenceClient, ScriptedTransport, TranscriptionCall,
    TranscriptionClient,
};
use relay_resilience::{
    EngineConfig, RateLimiter, RateLimiterConfig, RequestEngine, TimeoutConfig, TimeoutManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const COMPLETION: &str = r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#;
const SERVER_ERROR: &str = r#"{"error":{"message":"The server had an error"}}"#;

fn engine(max_requests: u32) -> RequestEngine {
    RequestEngine::new(
        Arc::new(RateLimiter::new(
            "integration",
            RateLimiterConfig {
                max_requests,
                window: Duration::from_secs(60),
            },
        )),
        EngineConfig::default(),
    )
}

fn inference_client(transport: &Arc<ScriptedTransport>, max_requests: u32) -> InferenceClient {
    InferenceClient::new(
        Arc::clone(transport) as _,
        engine(max_requests),
        EndpointConfig::default().with_base_url("http://relay.test"),
        TimeoutManager::new(TimeoutConfig {
            inference: Duration::from_secs(5),
            transcription: Duration::from_secs(10),
        }),
    )
}

fn transcription_client(transport: &Arc<ScriptedTransport>) -> TranscriptionClient {
    TranscriptionClient::new(
        Arc::clone(transport) as _,
        engine(100),
        EndpointConfig::default(),
        TimeoutManager::with_defaults(),
    )
}

fn credentials() -> Credentials {
    Credentials::new("sk-test-key-not-real").expect("valid key")
}

fn params() -> ModelParams {
    ModelParams::new(ModelName::new("gpt-4o-mini").expect("valid model"))
}

#[cfg(test)]
mod inference_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retried_until_success() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(500, SERVER_ERROR)
                .respond(502, "Bad Gateway")
                .respond(503, SERVER_ERROR)
                .respond(200, COMPLETION),
        );
        let client = inference_client(&transport, 100);
        let (credentials, params) = (credentials(), params());

        let response = client
            .call_remote_inference(InferenceCall::new("Hi", "sys", &credentials, &params))
            .await;

        assert!(response.success);
        assert_eq!(response.content.as_deref(), Some("ok"));
        assert_eq!(response.attempts, 4);
        assert_eq!(transport.request_count(), 4);
        assert!(transport
            .requests()
            .iter()
            .all(|r| r.url == "http://relay.test/v1/chat/completions"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_last_error() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(500, SERVER_ERROR)
                .respond(500, SERVER_ERROR),
        );
        let client = inference_client(&transport, 100);
        let (credentials, params) = (credentials(), params());

        let response = client
            .call_remote_inference(
                InferenceCall::new("Hi", "sys", &credentials, &params).with_max_retries(1),
            )
            .await;

        assert!(!response.success);
        assert!(!response.cancelled);
        assert_eq!(response.attempts, 2);
        let message = response.error_message.expect("message");
        assert!(message.contains("temporarily unavailable"));
        assert!(message.contains("The server had an error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_not_retried() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(401, r#"{"error":{"message":"Incorrect API key provided"}}"#)
                .respond(200, COMPLETION),
        );
        let client = inference_client(&transport, 100);
        let (credentials, params) = (credentials(), params());

        let response = client
            .call_remote_inference(InferenceCall::new("Hi", "sys", &credentials, &params))
            .await;

        assert!(!response.success);
        assert_eq!(response.attempts, 1);
        assert_eq!(transport.remaining(), 1);
        assert!(response
            .error_message
            .expect("message")
            .contains("Please check your API key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_rate_limit_retried() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond_with(
                    TransportResponse::new(429, r#"{"error":{"message":"slow down"}}"#)
                        .with_retry_after(Duration::from_secs(2)),
                )
                .respond(200, COMPLETION),
        );
        let client = inference_client(&transport, 100);
        let (credentials, params) = (credentials(), params());

        let response = client
            .call_remote_inference(InferenceCall::new("Hi", "sys", &credentials, &params))
            .await;

        assert!(response.success);
        assert_eq!(response.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_then_retries() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond_after(Duration::from_secs(30), 200, COMPLETION)
                .respond(200, COMPLETION),
        );
        let client = inference_client(&transport, 100);
        let (credentials, params) = (credentials(), params());

        let response = client
            .call_remote_inference(InferenceCall::new("Hi", "sys", &credentials, &params))
            .await;

        assert!(response.success);
        assert_eq!(response.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_limit_rejects_without_sending() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, COMPLETION));
        let client = inference_client(&transport, 0);
        let (credentials, params) = (credentials(), params());

        let response = client
            .call_remote_inference(InferenceCall::new("Hi", "sys", &credentials, &params))
            .await;

        assert!(!response.success);
        assert_eq!(response.attempts, 0);
        assert_eq!(transport.request_count(), 0);
        assert!(response
            .error_message
            .expect("message")
            .starts_with("Rate limit exceeded. Please wait"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = Arc::new(ScriptedTransport::new().respond(503, SERVER_ERROR));
        let client = inference_client(&transport, 100);
        let (credentials, params) = (credentials(), params());
        let token = CancellationToken::new();
        let canceller = token.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel("newer request started");
        });

        let start = Instant::now();
        let response = client
            .call_remote_inference(
                InferenceCall::new("Hi", "sys", &credentials, &params).with_token(&token),
            )
            .await;

        assert!(response.cancelled);
        assert!(!response.success);
        assert!(response.error_message.is_none());
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}

#[cfg(test)]
mod transcription_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transcription_success() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, r#"{"text":"hello"}"#));
        let client = transcription_client(&transport);
        let credentials = credentials();
        let model = ModelName::new("whisper-1").expect("valid model");

        let response = client
            .call_remote_transcription(TranscriptionCall::new(b"RIFF", &credentials, &model))
            .await;

        assert!(response.success);
        assert_eq!(response.text.as_deref(), Some("hello"));
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_upload_in_flight() {
        let transport = Arc::new(ScriptedTransport::new().hang());
        let client = transcription_client(&transport);
        let credentials = credentials();
        let model = ModelName::new("whisper-1").expect("valid model");
        let token = CancellationToken::new();
        let canceller = token.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            canceller.cancel("recording discarded");
        });

        let response = client
            .call_remote_transcription(
                TranscriptionCall::new(b"RIFF", &credentials, &model).with_token(&token),
            )
            .await;

        assert!(response.cancelled);
        assert_eq!(response.attempts, 1);
        assert!(response.error_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_not_retried() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail(RelayError::transport("connection reset"))
                .respond(200, r#"{"text":"late"}"#),
        );
        let client = transcription_client(&transport);
        let credentials = credentials();
        let model = ModelName::new("whisper-1").expect("valid model");

        let response = client
            .call_remote_transcription(TranscriptionCall::new(b"RIFF", &credentials, &model))
            .await;

        assert!(!response.success);
        assert_eq!(response.attempts, 1);
        assert!(response
            .error_message
            .expect("message")
            .contains("Network error: connection reset"));
    }
}
