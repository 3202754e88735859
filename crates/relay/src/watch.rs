//! Document change notifications.
//!
//! A [`DocumentWatcher`] turns filesystem events under a root directory into
//! [`DocumentEvent`]s and fans them out to registered [`ChangeListener`]s.
//! Caches listen so that edits to the underlying documents invalidate
//! aggregated values once the burst of edits settles.
//!
//! `notify` delivers events on its own thread. The watcher enters the tokio
//! runtime it was started from before dispatching, so listeners can spawn
//! timers there.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use relay_resilience::{ReadThroughCache, WeakReadThroughCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// A change to one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// A document was created
    Created(PathBuf),
    /// A document's content changed
    Modified(PathBuf),
    /// A document was removed
    Deleted(PathBuf),
    /// A document was moved
    Renamed {
        /// Previous path
        from: PathBuf,
        /// New path
        to: PathBuf,
    },
}

impl DocumentEvent {
    /// Paths touched by the event
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Deleted(p) => vec![p.as_path()],
            Self::Renamed { from, to } => vec![from.as_path(), to.as_path()],
        }
    }

    /// Short name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
            Self::Renamed { .. } => "renamed",
        }
    }
}

/// Receives document events
pub trait ChangeListener: Send + Sync {
    /// Called for every event that passes the watcher's filter
    fn on_document_event(&self, event: &DocumentEvent);

    /// Whether the listener still wants events; dead listeners are dropped
    fn is_alive(&self) -> bool {
        true
    }
}

impl<T: Clone + Send + 'static> ChangeListener for ReadThroughCache<T> {
    fn on_document_event(&self, _event: &DocumentEvent) {
        self.notify_change();
    }
}

impl<T: Clone + Send + 'static> ChangeListener for WeakReadThroughCache<T> {
    fn on_document_event(&self, _event: &DocumentEvent) {
        if let Some(cache) = self.upgrade() {
            cache.notify_change();
        }
    }

    fn is_alive(&self) -> bool {
        WeakReadThroughCache::is_alive(self)
    }
}

/// Map a raw filesystem event onto document events
///
/// Access and metadata-only events carry no content change and map to
/// nothing.
#[must_use]
pub fn document_events(event: &Event) -> Vec<DocumentEvent> {
    let each = |make: fn(PathBuf) -> DocumentEvent| -> Vec<DocumentEvent> {
        event.paths.iter().cloned().map(make).collect()
    };

    match event.kind {
        EventKind::Create(_) => each(DocumentEvent::Created),
        EventKind::Remove(_) => each(DocumentEvent::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![DocumentEvent::Renamed {
                from: from.clone(),
                to: to.clone(),
            }],
            _ => each(DocumentEvent::Modified),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(DocumentEvent::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(DocumentEvent::Created),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(DocumentEvent::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

struct Dispatcher {
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    extensions: Vec<String>,
}

impl Dispatcher {
    fn accepts(&self, event: &DocumentEvent) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        event.paths().iter().any(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
        })
    }

    fn dispatch(&self, event: &DocumentEvent) -> bool {
        if !self.accepts(event) {
            return false;
        }
        let listeners: Vec<_> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.is_alive());
            listeners.clone()
        };
        debug!(
            kind = event.kind(),
            listeners = listeners.len(),
            "Dispatching document event"
        );
        for listener in &listeners {
            listener.on_document_event(event);
        }
        true
    }
}

/// Watches a directory tree and notifies listeners of document changes
pub struct DocumentWatcher {
    dispatcher: Arc<Dispatcher>,
    watcher: Mutex<Option<(PathBuf, RecommendedWatcher)>>,
}

impl std::fmt::Debug for DocumentWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentWatcher")
            .field("extensions", &self.dispatcher.extensions)
            .field("root", &self.root())
            .finish_non_exhaustive()
    }
}

impl Default for DocumentWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentWatcher {
    /// Watch every file
    #[must_use]
    pub fn new() -> Self {
        Self::with_extensions(Vec::<String>::new())
    }

    /// Watch only files with one of `extensions` (case-insensitive, no dot)
    #[must_use]
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dispatcher: Arc::new(Dispatcher {
                listeners: RwLock::new(Vec::new()),
                extensions: extensions.into_iter().map(Into::into).collect(),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        let mut listeners = self.dispatcher.listeners.write();
        listeners.retain(|l| l.is_alive());
        listeners.push(listener);
    }

    /// Number of live listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.dispatcher
            .listeners
            .read()
            .iter()
            .filter(|l| l.is_alive())
            .count()
    }

    /// Feed an event from an external source
    ///
    /// Returns whether the event passed the extension filter.
    pub fn dispatch(&self, event: &DocumentEvent) -> bool {
        self.dispatcher.dispatch(event)
    }

    /// Start watching `root` recursively, replacing any previous watch
    ///
    /// Listeners run inside the calling tokio runtime, if there is one.
    ///
    /// # Errors
    /// Returns error if the platform watcher cannot be created or the root
    /// cannot be watched
    pub fn start(&self, root: impl AsRef<Path>) -> Result<(), notify::Error> {
        self.stop();

        let root = root.as_ref().to_path_buf();
        let dispatcher = Arc::clone(&self.dispatcher);
        let runtime = Handle::try_current().ok();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let _runtime = runtime.as_ref().map(Handle::enter);
            match res {
                Ok(event) => {
                    for document_event in document_events(&event) {
                        dispatcher.dispatch(&document_event);
                    }
                }
                Err(e) => warn!(error = %e, "Document watch error"),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "Watching documents");
        *self.watcher.lock() = Some((root, watcher));
        Ok(())
    }

    /// Stop watching
    pub fn stop(&self) {
        if let Some((root, _watcher)) = self.watcher.lock().take() {
            info!(root = %root.display(), "Document watcher stopped");
        }
    }

    /// Root currently being watched
    #[must_use]
    pub fn root(&self) -> Option<PathBuf> {
        self.watcher.lock().as_ref().map(|(root, _)| root.clone())
    }
}

impl Drop for DocumentWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DocumentEvent>>,
    }

    impl ChangeListener for Recorder {
        fn on_document_event(&self, event: &DocumentEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn raw(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(
            document_events(&raw(EventKind::Create(CreateKind::File), &["a.md"])),
            vec![DocumentEvent::Created("a.md".into())]
        );
        assert_eq!(
            document_events(&raw(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["a.md"]
            )),
            vec![DocumentEvent::Modified("a.md".into())]
        );
        assert_eq!(
            document_events(&raw(EventKind::Remove(RemoveKind::File), &["a.md"])),
            vec![DocumentEvent::Deleted("a.md".into())]
        );
        assert_eq!(
            document_events(&raw(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["a.md", "b.md"]
            )),
            vec![DocumentEvent::Renamed {
                from: "a.md".into(),
                to: "b.md".into()
            }]
        );
    }

    #[test]
    fn test_metadata_and_access_ignored() {
        assert!(document_events(&raw(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)),
            &["a.md"]
        ))
        .is_empty());
        assert!(document_events(&raw(
            EventKind::Access(notify::event::AccessKind::Any),
            &["a.md"]
        ))
        .is_empty());
    }

    #[test]
    fn test_extension_filter() {
        let watcher = DocumentWatcher::with_extensions(["md"]);
        let recorder = Arc::new(Recorder::default());
        watcher.add_listener(Arc::clone(&recorder) as Arc<dyn ChangeListener>);

        assert!(watcher.dispatch(&DocumentEvent::Modified("notes/a.MD".into())));
        assert!(!watcher.dispatch(&DocumentEvent::Modified("image.png".into())));
        assert!(watcher.dispatch(&DocumentEvent::Renamed {
            from: "draft.txt".into(),
            to: "final.md".into(),
        }));
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_cache_listener_is_pruned() {
        let watcher = DocumentWatcher::new();
        let kept: ReadThroughCache<u32> =
            ReadThroughCache::new("kept", relay_resilience::CacheConfig::default());
        let dropped: ReadThroughCache<u32> =
            ReadThroughCache::new("dropped", relay_resilience::CacheConfig::default());
        watcher.add_listener(Arc::new(kept.downgrade()));
        watcher.add_listener(Arc::new(dropped.downgrade()));
        assert_eq!(watcher.listener_count(), 2);

        drop(dropped);
        assert_eq!(watcher.listener_count(), 1);
        assert!(watcher.dispatch(&DocumentEvent::Modified("a.md".into())));
        assert_eq!(watcher.dispatcher.listeners.read().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_listener_debounces() {
        let cache: ReadThroughCache<u32> =
            ReadThroughCache::new("documents", relay_resilience::CacheConfig::default());
        cache.set("total", 1);

        let watcher = DocumentWatcher::new();
        watcher.add_listener(Arc::new(cache.clone()));

        for _ in 0..5 {
            watcher.dispatch(&DocumentEvent::Modified("a.md".into()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(cache.get("total"), Some(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cache.get("total"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listeners_run_inside_runtime() {
        struct RuntimeCheck(Mutex<Vec<bool>>);
        impl ChangeListener for RuntimeCheck {
            fn on_document_event(&self, _event: &DocumentEvent) {
                self.0.lock().push(Handle::try_current().is_ok());
            }
        }

        let dir = tempfile::tempdir().expect("temp dir");
        let watcher = DocumentWatcher::new();
        let seen = Arc::new(RuntimeCheck(Mutex::new(Vec::new())));
        watcher.add_listener(Arc::clone(&seen) as Arc<dyn ChangeListener>);
        watcher.start(dir.path()).expect("watch");

        tokio::fs::write(dir.path().join("note.md"), "hello")
            .await
            .expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while seen.0.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let seen = seen.0.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|in_runtime| *in_runtime));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_filesystem_events_reach_listeners() {
        let dir = tempfile::tempdir().expect("temp dir");
        let watcher = DocumentWatcher::new();
        let recorder = Arc::new(Recorder::default());
        watcher.add_listener(Arc::clone(&recorder) as Arc<dyn ChangeListener>);
        watcher.start(dir.path()).expect("watch");
        assert_eq!(watcher.root().as_deref(), Some(dir.path()));

        tokio::fs::write(dir.path().join("note.md"), "hello")
            .await
            .expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while recorder.events.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!recorder.events.lock().is_empty());

        watcher.stop();
        assert!(watcher.root().is_none());
    }
}
