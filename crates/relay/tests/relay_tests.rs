//! End-to-end tests through the `Relay` composition root.

use relay::{
    DocumentEvent, InferenceCall, Relay, RelayConfig, TranscriptionCall, SUPERSEDED_REASON,
};
use relay_providers::ScriptedTransport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const COMPLETION: &str = r#"{"choices":[{"message":{"role":"assistant","content":"summary"}}]}"#;

fn relay(transport: &Arc<ScriptedTransport>, config: RelayConfig) -> Relay {
    Relay::builder()
        .config(config)
        .transport(Arc::clone(transport) as _)
        .build()
        .expect("relay")
}

fn gather(relay: &Relay) -> String {
    relay
        .metrics()
        .expect("metrics enabled")
        .gather_text()
        .expect("encode metrics")
}

#[tokio::test(start_paused = true)]
async fn test_newer_request_supersedes_older() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .respond_after(Duration::from_secs(20), 200, COMPLETION)
            .respond(200, COMPLETION),
    );
    let relay = relay(&transport, RelayConfig::default());
    let credentials = relay.credentials("sk-test").expect("credentials");
    let params = relay.default_model_params().expect("params");

    let first_token = relay.slots().begin("summarize");
    let first = relay.call_remote_inference(
        InferenceCall::new("first", "sys", &credentials, &params).with_token(&first_token),
    );
    let second = async {
        sleep(Duration::from_millis(100)).await;
        let token = relay.slots().begin("summarize");
        let response = relay
            .call_remote_inference(
                InferenceCall::new("second", "sys", &credentials, &params).with_token(&token),
            )
            .await;
        assert!(relay.slots().finish("summarize", &token));
        response
    };

    let (first, second) = tokio::join!(first, second);

    assert!(first.cancelled);
    assert!(!first.success);
    assert!(first.error_message.is_none());
    assert_eq!(first_token.reason().as_deref(), Some(SUPERSEDED_REASON));

    assert!(second.success);
    assert_eq!(second.content.as_deref(), Some("summary"));

    let text = gather(&relay);
    assert!(text.contains(r#"relay_calls_total{endpoint="inference",outcome="cancelled"} 1"#));
    assert!(text.contains(r#"relay_calls_total{endpoint="inference",outcome="success"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn test_local_rate_limit_is_shared_across_endpoints() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .respond(200, COMPLETION)
            .respond(200, r#"{"text":"never sent"}"#),
    );
    let mut config = RelayConfig::default();
    config.resilience.rate_limit.max_requests = 1;
    let relay = relay(&transport, config);
    let credentials = relay.credentials("sk-test").expect("credentials");
    let params = relay.default_model_params().expect("params");
    let model = relay.transcription_model().expect("model");

    let inference = relay
        .call_remote_inference(InferenceCall::new("hi", "sys", &credentials, &params))
        .await;
    assert!(inference.success);

    let transcription = relay
        .call_remote_transcription(TranscriptionCall::new(b"RIFF", &credentials, &model))
        .await;
    assert!(!transcription.success);
    assert_eq!(transcription.attempts, 0);
    assert_eq!(transport.request_count(), 1);

    let metrics = relay.metrics().expect("metrics enabled");
    assert_eq!(metrics.rate_limit_rejections(), 1);
    assert!(gather(&relay).contains(
        r#"relay_call_errors_total{endpoint="transcription",error_code="rate_limited"} 1"#
    ));

    // The window slides: a minute later the limiter admits again.
    tokio::time::advance(Duration::from_secs(61)).await;
    let transcription = relay
        .call_remote_transcription(TranscriptionCall::new(b"RIFF", &credentials, &model))
        .await;
    assert!(transcription.success);
    assert_eq!(transcription.text.as_deref(), Some("never sent"));
}

#[tokio::test(start_paused = true)]
async fn test_document_changes_invalidate_caches_after_quiet_period() {
    let transport = Arc::new(ScriptedTransport::new());
    let relay = relay(&transport, RelayConfig::default());
    let cache = relay.cache::<usize>("word-counts");
    let loads = Arc::new(AtomicUsize::new(0));

    let load = || {
        let loads = Arc::clone(&loads);
        async move { Ok::<_, ()>(loads.fetch_add(1, Ordering::SeqCst) + 100) }
    };

    assert_eq!(cache.get_or_load_async("vault", load).await, Ok(100));
    assert_eq!(cache.get_or_load_async("vault", load).await, Ok(100));

    let start = Instant::now();
    for i in 0..3 {
        relay.notify_document_event(&DocumentEvent::Modified(format!("note-{i}.md").into()));
        sleep(Duration::from_millis(200)).await;
    }
    // Last notification at +400ms; invalidation is due at +900ms.
    assert_eq!(cache.get("vault"), Some(100));
    sleep(Duration::from_millis(520)).await;
    assert!(start.elapsed() >= Duration::from_millis(900));

    assert_eq!(cache.get_or_load_async("vault", load).await, Ok(101));
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    let text = gather(&relay);
    assert!(text.contains(r#"relay_cache_invalidations_total{cache="word-counts"} 1"#));
    assert!(text.contains(r#"relay_cache_lookups_total{cache="word-counts",result="hit"}"#));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_running_operations() {
    let transport = Arc::new(ScriptedTransport::new().hang());
    let relay = Arc::new(relay(&transport, RelayConfig::default()));
    let credentials = relay.credentials("sk-test").expect("credentials");
    let model = relay.transcription_model().expect("model");
    let cache = relay.cache::<String>("transcripts");
    cache.set("latest", "text".to_string());

    let token = relay.slots().begin("transcribe");
    let stopper = Arc::clone(&relay);
    tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        stopper.shutdown();
    });

    let response = relay
        .call_remote_transcription(
            TranscriptionCall::new(b"RIFF", &credentials, &model).with_token(&token),
        )
        .await;

    assert!(response.cancelled);
    assert!(relay.is_shut_down());
    assert!(cache.is_destroyed());
    assert_eq!(cache.get("latest"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_file_reload_reconfigures_limiter() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("relay.yaml");
    tokio::fs::write(&path, "resilience:\n  rate_limit:\n    max_requests: 5\n")
        .await
        .expect("write config");

    let mut config = RelayConfig::default();
    config.cache.debounce = Duration::from_millis(50);
    let relay = Relay::builder()
        .config(config)
        .transport(Arc::new(ScriptedTransport::new()))
        .watch_config(&path)
        .build()
        .expect("relay");
    assert_eq!(relay.limiter().config().max_requests, 10);

    tokio::fs::write(&path, "resilience:\n  rate_limit:\n    max_requests: 2\n    window: 10s\n")
        .await
        .expect("write config");

    let deadline = Instant::now() + Duration::from_secs(10);
    while relay.limiter().config().max_requests != 2 && Instant::now() < deadline {
        sleep(Duration::from_millis(25)).await;
    }
    let limiter = relay.limiter().config();
    assert_eq!(limiter.max_requests, 2);
    assert_eq!(limiter.window, Duration::from_secs(10));
    assert_eq!(relay.config().resilience.rate_limit.max_requests, 2);

    relay.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watched_document_burst_invalidates_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = RelayConfig::default();
    config.cache.debounce = Duration::from_millis(300);
    let relay = relay(&Arc::new(ScriptedTransport::new()), config);
    let cache = relay.cache::<u32>("counts");
    cache.set("total", 1);
    relay.watch_documents(dir.path()).expect("watch documents");

    let mut last_write = Instant::now();
    for i in 0..5 {
        tokio::fs::write(dir.path().join(format!("note-{i}.md")), "text")
            .await
            .expect("write document");
        last_write = Instant::now();
        sleep(Duration::from_millis(20)).await;
    }

    // Still inside the quiet period: nothing invalidated yet.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.version(), 0);
    assert_eq!(cache.get("total"), Some(1));

    let deadline = Instant::now() + Duration::from_secs(10);
    while cache.version() == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cache.version(), 1);
    assert!(last_write.elapsed() >= Duration::from_millis(300));
    assert_eq!(cache.get("total"), None);

    // The burst collapses into a single invalidation.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(cache.version(), 1);
    assert!(gather(&relay).contains(r#"relay_cache_invalidations_total{cache="counts"} 1"#));

    relay.shutdown();
}
