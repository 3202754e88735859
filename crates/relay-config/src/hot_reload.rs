//! Hot reload support for configuration changes.
//!
//! The watched file's parent directory is observed with `notify`; bursts of
//! filesystem events for the file are collapsed by a [`Debouncer`] into one
//! reload. A reload that fails to parse or validate keeps the previous
//! configuration.

use crate::loader::{ConfigError, ConfigLoader};
use crate::schema::RelayConfig;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use relay_resilience::Debouncer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type ReloadCallback = Arc<dyn Fn(&RelayConfig) + Send + Sync>;

struct Shared {
    config: ArcSwap<RelayConfig>,
    subscribers: RwLock<Vec<ReloadCallback>>,
    env_prefix: Option<String>,
}

impl Shared {
    fn store(&self, config: RelayConfig) -> Arc<RelayConfig> {
        let config = Arc::new(config);
        self.config.store(Arc::clone(&config));
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber(&config);
        }
        config
    }

    async fn reload(&self, path: &Path) -> Result<Arc<RelayConfig>, ConfigError> {
        let mut loader = ConfigLoader::new().with_file(path);
        if let Some(ref prefix) = self.env_prefix {
            loader = loader.with_env_prefix(prefix.clone());
        }
        let config = loader.load().await?;
        Ok(self.store(config))
    }
}

/// Configuration watcher for hot reload
pub struct ConfigWatcher {
    shared: Arc<Shared>,
    debounce: Duration,
    watcher: Mutex<Option<RecommendedWatcher>>,
    debouncer: Mutex<Option<Arc<Debouncer>>>,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("debounce", &self.debounce)
            .field("watching", &self.is_watching())
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// Create a new config watcher with the given initial configuration
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self::with_options(config, None, Duration::from_millis(500))
    }

    /// Create a watcher that applies `<prefix>_*` overrides on every reload
    /// and waits `debounce` after the last file event before reloading
    #[must_use]
    pub fn with_options(config: RelayConfig, env_prefix: Option<String>, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: ArcSwap::from_pointee(config),
                subscribers: RwLock::new(Vec::new()),
                env_prefix,
            }),
            debounce,
            watcher: Mutex::new(None),
            debouncer: Mutex::new(None),
        }
    }

    /// Get a snapshot of the current configuration
    #[must_use]
    pub fn load(&self) -> Arc<RelayConfig> {
        self.shared.config.load_full()
    }

    /// Register a callback run after every successful reload or update
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&RelayConfig) + Send + Sync + 'static,
    {
        self.shared.subscribers.write().push(Arc::new(callback));
    }

    /// Replace the configuration and notify subscribers
    pub fn update(&self, new_config: RelayConfig) {
        self.shared.store(new_config);
        info!("Configuration updated");
    }

    /// Whether a file is being watched
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Start watching a configuration file for changes
    ///
    /// Replaces any previous watch. Reloads run on the calling tokio runtime.
    ///
    /// # Errors
    /// Returns [`ConfigError::NoRuntime`] outside a tokio runtime, or an error
    /// if file watching cannot be started
    pub fn watch_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        self.stop();

        let path = path.as_ref().to_path_buf();

        let shared = Arc::clone(&self.shared);
        let reload_path = path.clone();
        let spawner = runtime.clone();
        let debouncer = Arc::new(Debouncer::spawn_on(&runtime, "config-reload", self.debounce, move || {
            let shared = Arc::clone(&shared);
            let path = reload_path.clone();
            spawner.spawn(async move {
                match shared.reload(&path).await {
                    Ok(_) => info!(path = %path.display(), "Configuration reloaded"),
                    Err(e) => error!(
                        path = %path.display(),
                        error = %e,
                        "Configuration reload failed, keeping previous configuration"
                    ),
                }
            });
        }));
        let trigger = Arc::clone(&debouncer);

        let file_name = path.file_name().map(ToOwned::to_owned);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                    if relevant {
                        debug!(paths = ?event.paths, "Configuration file changed");
                        trigger.trigger();
                    }
                }
                Err(e) => warn!(error = %e, "Configuration watch error"),
            }
        })?;

        let watch_path = watch_root(&path);
        watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "Watching configuration file");

        *self.watcher.lock() = Some(watcher);
        *self.debouncer.lock() = Some(debouncer);
        Ok(())
    }

    /// Stop watching for configuration changes; a pending reload is dropped
    pub fn stop(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(debouncer) = self.debouncer.lock().take() {
            debouncer.shutdown();
        }
        if watcher.is_some() {
            info!("Configuration watcher stopped");
        }
    }

    /// Manually trigger a configuration reload
    ///
    /// # Errors
    /// Returns error if reload fails; the current configuration is kept
    pub async fn reload(&self, path: impl AsRef<Path>) -> Result<Arc<RelayConfig>, ConfigError> {
        let config = self.shared.reload(path.as_ref()).await?;
        info!("Configuration manually reloaded");
        Ok(config)
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_root(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
