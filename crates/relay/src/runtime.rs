//! The relay composition root.
//!
//! [`Relay`] owns the one rate limiter, the endpoint clients built on top of
//! it, the caches handed out to callers and the watchers that feed them. All
//! shared state lives here and is passed down by handle.

use crate::slots::OperationSlots;
use crate::watch::{ChangeListener, DocumentEvent, DocumentWatcher};
use parking_lot::Mutex;
use relay_config::{ConfigWatcher, RelayConfig, DEFAULT_ENV_PREFIX};
use relay_core::{
    Credentials, InferenceResponse, MaxTokens, ModelName, ModelParams, RateLimitOrigin, RelayError,
    Temperature, Transport, TranscriptionResponse,
};
use relay_providers::{
    inference_response, transcription_response, EndpointConfig, HttpClientConfig, InferenceCall,
    InferenceClient, ReqwestTransport, TranscriptionCall, TranscriptionClient,
};
use relay_resilience::{
    CacheEvent, CallOutcome, RateLimiter, ReadThroughCache, RequestEngine, TimeoutManager,
    WeakReadThroughCache,
};
use relay_telemetry::{CallMetrics, RelayMetrics};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Reason given to operations still running at shutdown
pub const SHUTDOWN_REASON: &str = "relay shutting down";

/// A cache handed out by [`Relay::cache`], held without owning it
trait RegisteredCache: Send + Sync {
    /// Destroy the cache; returns whether it was still alive
    fn destroy(&self) -> bool;
    fn is_alive(&self) -> bool;
}

impl<T: Clone + Send + 'static> RegisteredCache for WeakReadThroughCache<T> {
    fn destroy(&self) -> bool {
        let Some(cache) = self.upgrade() else {
            return false;
        };
        cache.destroy();
        true
    }

    fn is_alive(&self) -> bool {
        WeakReadThroughCache::is_alive(self)
    }
}

/// Resilient client for the remote inference API
pub struct Relay {
    config: ConfigWatcher,
    limiter: Arc<RateLimiter>,
    inference: InferenceClient,
    transcription: TranscriptionClient,
    metrics: Option<RelayMetrics>,
    slots: OperationSlots,
    documents: DocumentWatcher,
    caches: Mutex<Vec<Box<dyn RegisteredCache>>>,
    /// Runtime the relay was built in; cache timers run there
    runtime: Option<Handle>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("limiter", &self.limiter)
            .field("slots", &self.slots)
            .field("documents", &self.documents)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a new relay builder
    #[must_use]
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> Arc<RelayConfig> {
        self.config.load()
    }

    /// Configuration watcher; updates apply new rate-limit settings
    #[must_use]
    pub fn config_watcher(&self) -> &ConfigWatcher {
        &self.config
    }

    /// The shared outbound rate limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Metrics, if enabled
    #[must_use]
    pub fn metrics(&self) -> Option<&RelayMetrics> {
        self.metrics.as_ref()
    }

    /// Last-wins operation slots
    #[must_use]
    pub fn slots(&self) -> &OperationSlots {
        &self.slots
    }

    /// Document watcher feeding cache invalidation
    #[must_use]
    pub fn documents(&self) -> &DocumentWatcher {
        &self.documents
    }

    /// Credentials carrying the configured organization, if any
    ///
    /// # Errors
    /// Returns `RelayError::Configuration` if the key is empty
    pub fn credentials(&self, api_key: impl Into<String>) -> Result<Credentials, RelayError> {
        let credentials =
            Credentials::new(api_key).map_err(|e| RelayError::configuration(e.to_string()))?;
        Ok(match self.config().endpoints.organization.clone() {
            Some(org) => credentials.with_organization(org),
            None => credentials,
        })
    }

    /// Model parameters from the endpoint defaults
    ///
    /// # Errors
    /// Returns `RelayError::Configuration` if a configured default is invalid
    pub fn default_model_params(&self) -> Result<ModelParams, RelayError> {
        let config = self.config();
        let endpoints = &config.endpoints;
        let invalid = |e: relay_core::ValidationError| RelayError::configuration(e.to_string());

        Ok(ModelParams::new(ModelName::new(endpoints.inference_model.clone()).map_err(invalid)?)
            .with_max_tokens(MaxTokens::new(endpoints.max_tokens).map_err(invalid)?)
            .with_temperature(Temperature::new(endpoints.temperature).map_err(invalid)?))
    }

    /// Transcription model from the endpoint defaults
    ///
    /// # Errors
    /// Returns `RelayError::Configuration` if the configured model is invalid
    pub fn transcription_model(&self) -> Result<ModelName, RelayError> {
        ModelName::new(self.config().endpoints.transcription_model.clone())
            .map_err(|e| RelayError::configuration(e.to_string()))
    }

    /// Call the chat-completion endpoint
    pub async fn call_remote_inference(&self, call: InferenceCall<'_>) -> InferenceResponse {
        let started = Instant::now();
        let outcome = self.inference.execute(&call).await;
        self.record_call("inference", &outcome, started.elapsed());
        inference_response(outcome)
    }

    /// Call the transcription endpoint
    pub async fn call_remote_transcription(
        &self,
        call: TranscriptionCall<'_>,
    ) -> TranscriptionResponse {
        let started = Instant::now();
        let outcome = self.transcription.execute(&call).await;
        self.record_call("transcription", &outcome, started.elapsed());
        transcription_response(outcome)
    }

    fn record_call<T>(&self, endpoint: &str, outcome: &CallOutcome<T>, duration: Duration) {
        let Some(metrics) = self.metrics.as_ref() else {
            return;
        };
        let locally_limited = matches!(
            outcome.error,
            Some(RelayError::RateLimited {
                origin: RateLimitOrigin::Local,
                ..
            })
        ) && outcome.attempts == 0;

        metrics.record_call(&CallMetrics {
            endpoint,
            success: outcome.is_success(),
            cancelled: outcome.cancelled,
            attempts: outcome.attempts,
            error_code: outcome.error.as_ref().map(RelayError::error_code),
            locally_limited,
            duration,
        });
    }

    /// Create a cache using the configured defaults
    ///
    /// The cache reports to metrics and is invalidated (debounced) by
    /// document events. The relay only holds it weakly: the cache lives as
    /// long as the returned handle and its clones, and one still alive at
    /// [`shutdown`](Self::shutdown) is destroyed then.
    pub fn cache<T>(&self, name: &str) -> ReadThroughCache<T>
    where
        T: Clone + Send + 'static,
    {
        let config = self.config().cache_config();
        let _runtime = self.runtime.as_ref().map(Handle::enter);
        let cache = match self.metrics.clone() {
            Some(metrics) => ReadThroughCache::with_observer(name, config, move |cache, event| {
                match event {
                    CacheEvent::Lookup(result) => metrics.record_cache_lookup(cache, result.as_str()),
                    CacheEvent::Evicted => metrics.record_cache_eviction(cache),
                    CacheEvent::Invalidated => metrics.record_cache_invalidation(cache),
                }
            }),
            None => ReadThroughCache::new(name, config),
        };

        self.documents
            .add_listener(Arc::new(cache.downgrade()) as Arc<dyn ChangeListener>);
        {
            let mut caches = self.caches.lock();
            caches.retain(|c| c.is_alive());
            caches.push(Box::new(cache.downgrade()));
        }

        debug!(cache = name, capacity = config.capacity, "Cache registered");
        cache
    }

    /// Number of caches handed out that are still alive
    #[must_use]
    pub fn live_caches(&self) -> usize {
        self.caches.lock().iter().filter(|c| c.is_alive()).count()
    }

    /// Watch a document tree; changes invalidate every registered cache
    ///
    /// # Errors
    /// Returns `RelayError::Configuration` if the directory cannot be watched
    pub fn watch_documents(&self, root: impl AsRef<Path>) -> Result<(), RelayError> {
        let root = root.as_ref();
        self.documents.start(root).map_err(|e| {
            RelayError::configuration(format!("Failed to watch {}: {e}", root.display()))
        })
    }

    /// Feed a change from an external notification source
    pub fn notify_document_event(&self, event: &DocumentEvent) -> bool {
        self.documents.dispatch(event)
    }

    /// Cancel running operations, stop watchers and destroy caches
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.slots.cancel_all(SHUTDOWN_REASON);
        self.config.stop();
        self.documents.stop();

        let caches = std::mem::take(&mut *self.caches.lock());
        let destroyed = caches.iter().filter(|c| c.destroy()).count();

        info!(
            cancelled_operations = cancelled,
            caches = destroyed,
            "Relay shut down"
        );
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Relay`]
#[derive(Default)]
pub struct RelayBuilder {
    config: Option<RelayConfig>,
    transport: Option<Arc<dyn Transport>>,
    metrics: Option<RelayMetrics>,
    config_path: Option<PathBuf>,
    document_extensions: Vec<String>,
}

impl RelayBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom transport instead of reqwest
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use existing metrics instead of creating them from the configuration
    #[must_use]
    pub fn metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hot-reload configuration from this file
    #[must_use]
    pub fn watch_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Only treat files with these extensions as documents
    #[must_use]
    pub fn document_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Build the relay
    ///
    /// Building inside a tokio runtime ties cache timers and configuration
    /// reloads to that runtime. Watching a configuration file requires one.
    ///
    /// # Errors
    /// Returns `RelayError::Configuration` if the configuration is invalid,
    /// the HTTP client or metrics cannot be created, or the configuration
    /// file cannot be watched (including when no runtime is available)
    pub fn build(self) -> Result<Relay, RelayError> {
        let config = self.config.unwrap_or_default();
        config
            .validate_config()
            .map_err(|e| RelayError::configuration(e.to_string()))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(HttpClientConfig {
                connect_timeout: config.resilience.timeout.connect,
                ..HttpClientConfig::default()
            })?),
        };

        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if config.observability.metrics.enabled => Some(
                RelayMetrics::new(&config.observability.metrics)
                    .map_err(|e| RelayError::configuration(format!("Failed to create metrics: {e}")))?,
            ),
            None => None,
        };

        let limiter = Arc::new(RateLimiter::new("relay", config.rate_limiter_config()));
        let engine = RequestEngine::new(Arc::clone(&limiter), config.engine_config());
        let endpoint = EndpointConfig {
            base_url: config.endpoints.base_url.clone(),
            chat_path: config.endpoints.chat_path.clone(),
            transcription_path: config.endpoints.transcription_path.clone(),
        };
        let timeouts = TimeoutManager::new(config.timeout_config());

        let inference = InferenceClient::new(
            Arc::clone(&transport),
            engine.clone(),
            endpoint.clone(),
            timeouts,
        );
        let transcription = TranscriptionClient::new(transport, engine, endpoint, timeouts);

        let debounce = config.cache.debounce;
        let watcher =
            ConfigWatcher::with_options(config, Some(DEFAULT_ENV_PREFIX.to_string()), debounce);
        let reconfigure = Arc::clone(&limiter);
        watcher.subscribe(move |config| {
            let limit = config.rate_limiter_config();
            reconfigure.configure(limit.max_requests, limit.window);
        });
        if let Some(path) = self.config_path {
            watcher
                .watch_file(&path)
                .map_err(|e| RelayError::configuration(e.to_string()))?;
        }

        info!(
            base_url = %watcher.load().endpoints.base_url,
            metrics = metrics.is_some(),
            "Relay initialized"
        );

        Ok(Relay {
            config: watcher,
            limiter,
            inference,
            transcription,
            metrics,
            slots: OperationSlots::new(),
            documents: DocumentWatcher::with_extensions(self.document_extensions),
            caches: Mutex::new(Vec::new()),
            runtime: Handle::try_current().ok(),
            shut_down: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_providers::ScriptedTransport;

    fn relay_with(transport: ScriptedTransport) -> Relay {
        Relay::builder()
            .transport(Arc::new(transport))
            .build()
            .expect("relay")
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RelayConfig::default();
        config.resilience.rate_limit.max_requests = 0;
        let result = Relay::builder()
            .config(config)
            .transport(Arc::new(ScriptedTransport::new()))
            .build();
        assert!(matches!(result, Err(RelayError::Configuration { .. })));
    }

    #[test]
    fn test_defaults_from_config() {
        let mut config = RelayConfig::default();
        config.endpoints.organization = Some("org-1".to_string());
        config.endpoints.max_tokens = 512;
        let relay = Relay::builder()
            .config(config)
            .transport(Arc::new(ScriptedTransport::new()))
            .build()
            .expect("relay");

        let params = relay.default_model_params().expect("params");
        assert_eq!(params.model.as_str(), "gpt-4o-mini");
        assert_eq!(params.max_tokens.value(), 512);
        assert_eq!(relay.transcription_model().expect("model").as_str(), "whisper-1");

        let credentials = relay.credentials("sk-test").expect("credentials");
        assert_eq!(credentials.organization.as_deref(), Some("org-1"));
        assert!(relay.credentials("").is_err());
    }

    #[test]
    fn test_config_update_reconfigures_limiter() {
        let relay = relay_with(ScriptedTransport::new());
        assert_eq!(relay.limiter().config().max_requests, 10);

        let mut config = RelayConfig::default();
        config.resilience.rate_limit.max_requests = 2;
        config.resilience.rate_limit.window = Duration::from_secs(5);
        relay.config_watcher().update(config);

        let limiter = relay.limiter().config();
        assert_eq!(limiter.max_requests, 2);
        assert_eq!(limiter.window, Duration::from_secs(5));
    }

    #[test]
    fn test_metrics_disabled() {
        let mut config = RelayConfig::default();
        config.observability.metrics.enabled = false;
        let relay = Relay::builder()
            .config(config)
            .transport(Arc::new(ScriptedTransport::new()))
            .build()
            .expect("relay");
        assert!(relay.metrics().is_none());
    }

    #[test]
    fn test_watch_config_outside_runtime_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = Relay::builder()
            .transport(Arc::new(ScriptedTransport::new()))
            .watch_config(dir.path().join("relay.yaml"))
            .build();

        match result {
            Err(RelayError::Configuration { message }) => {
                assert!(message.contains("tokio runtime"), "{message}");
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_dropped_caches_are_released() {
        let relay = relay_with(ScriptedTransport::new());
        let kept: ReadThroughCache<u32> = relay.cache("kept");
        for i in 0..10 {
            let transient: ReadThroughCache<u32> = relay.cache(&format!("transient-{i}"));
            transient.set("k", i);
        }

        assert_eq!(relay.live_caches(), 1);
        assert_eq!(relay.documents().listener_count(), 1);
        assert!(relay.caches.lock().len() <= 2);

        relay.shutdown();
        assert!(kept.is_destroyed());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let relay = relay_with(ScriptedTransport::new());
        let cache: ReadThroughCache<String> = relay.cache("summaries");
        cache.set("k", "v".to_string());
        let token = relay.slots().begin("summarize");

        relay.shutdown();
        relay.shutdown();

        assert!(relay.is_shut_down());
        assert!(cache.is_destroyed());
        assert!(cache.is_empty());
        assert_eq!(token.reason().as_deref(), Some(SHUTDOWN_REASON));
    }
}
