//! Read-through caching for expensive local aggregation.
//!
//! [`ReadThroughCache`] is a string-keyed cache combining three validity
//! rules: a TTL per entry, an LRU bound on the number of entries, and a
//! monotonic global version. Bumping the version invalidates everything in
//! O(1); entries carrying an old version (or past their TTL) are dropped
//! lazily the next time they are looked up.
//!
//! Bulk invalidation is usually driven by change notifications. Those arrive
//! in bursts, so [`ReadThroughCache::notify_change`] debounces them and only
//! invalidates once the burst is over.

use crate::debounce::Debouncer;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Lifetime of an entry
    pub ttl: Duration,
    /// Quiet period after the last change notification before invalidating
    pub debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(60),
            debounce: Duration::from_millis(500),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a valid entry
    pub hits: u64,
    /// Lookups with no entry
    pub misses: u64,
    /// Lookups that found an entry past its TTL
    pub expired: u64,
    /// Lookups that found an entry from an older version
    pub stale: u64,
    /// Entries removed to stay within capacity
    pub evictions: u64,
    /// Loader invocations
    pub loads: u64,
    /// Bulk invalidations
    pub invalidations: u64,
    /// Current number of stored entries (valid or not yet pruned)
    pub entries: usize,
}

impl CacheStats {
    /// Calculate hit rate
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.expired + self.stale;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// Cache lookup result for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookupResult {
    /// Valid entry found
    Hit,
    /// No entry
    Miss,
    /// Entry dropped because its TTL elapsed
    Expired,
    /// Entry dropped because the cache was invalidated after it was stored
    Stale,
}

impl CacheLookupResult {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Expired => "expired",
            Self::Stale => "stale",
        }
    }
}

/// Events reported to a cache observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// A lookup completed
    Lookup(CacheLookupResult),
    /// An entry was evicted for capacity
    Evicted,
    /// The whole cache was invalidated
    Invalidated,
}

type CacheObserver = Arc<dyn Fn(&str, CacheEvent) + Send + Sync>;

/// Per-key load locks with the number of callers holding a ticket
type LoadGates = Mutex<HashMap<String, (Arc<tokio::sync::Mutex<()>>, usize)>>;

/// A caller's place in a key's load gate
///
/// Dropping the ticket, on completion or when the load future is dropped
/// mid-await, releases the gate entry once no caller holds it.
struct GateTicket<'a> {
    gates: &'a LoadGates,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> GateTicket<'a> {
    fn join(gates: &'a LoadGates, key: &'a str) -> Self {
        let mut map = gates.lock();
        let (lock, holders) = map
            .entry(key.to_string())
            .or_insert_with(|| (Arc::new(tokio::sync::Mutex::new(())), 0));
        *holders += 1;
        let lock = Arc::clone(lock);
        drop(map);
        Self { gates, key, lock }
    }
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut map = self.gates.lock();
        if let Some((_, holders)) = map.get_mut(self.key) {
            *holders = holders.saturating_sub(1);
            if *holders == 0 {
                map.remove(self.key);
            }
        }
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    version: u64,
    tick: u64,
}

#[derive(Debug)]
struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Recency index: access tick to key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    stats: CacheStats,
}

impl<T> CacheState<T> {
    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

struct CacheInner<T> {
    name: String,
    config: CacheConfig,
    version: AtomicU64,
    state: Mutex<CacheState<T>>,
    /// Per-key gates that coalesce concurrent async loads
    loads: LoadGates,
    /// Runtime the debounce timer runs on, captured at construction
    runtime: Option<Handle>,
    debouncer: Mutex<Option<Debouncer>>,
    destroyed: AtomicBool,
    observer: Option<CacheObserver>,
}

impl<T> CacheInner<T> {
    fn emit(&self, event: CacheEvent) {
        if let Some(observer) = &self.observer {
            observer(&self.name, event);
        }
    }

    fn invalidate_all(&self) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().stats.invalidations += 1;
        info!(cache = %self.name, version, "Cache invalidated");
        self.emit(CacheEvent::Invalidated);
    }
}

/// TTL + LRU + version cache keyed by strings
///
/// Cloning yields another handle to the same cache.
pub struct ReadThroughCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ReadThroughCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ReadThroughCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("version", &self.inner.version.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`ReadThroughCache`]
///
/// Registries hold these so that a cache is freed once its last owning
/// handle is dropped.
pub struct WeakReadThroughCache<T> {
    inner: Weak<CacheInner<T>>,
}

impl<T> Clone for WeakReadThroughCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for WeakReadThroughCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakReadThroughCache")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<T> WeakReadThroughCache<T> {
    /// Owning handle, if the cache still exists
    #[must_use]
    pub fn upgrade(&self) -> Option<ReadThroughCache<T>> {
        self.inner.upgrade().map(|inner| ReadThroughCache { inner })
    }

    /// Whether any owning handle is left
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> ReadThroughCache<T> {
    /// Non-owning handle to this cache
    #[must_use]
    pub fn downgrade(&self) -> WeakReadThroughCache<T> {
        WeakReadThroughCache {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> ReadThroughCache<T> {
    /// Create a new cache
    #[must_use]
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self::build(name.into(), config, None)
    }

    /// Create a cache that reports lookups, evictions and invalidations
    #[must_use]
    pub fn with_observer<F>(name: impl Into<String>, config: CacheConfig, observer: F) -> Self
    where
        F: Fn(&str, CacheEvent) + Send + Sync + 'static,
    {
        Self::build(name.into(), config, Some(Arc::new(observer)))
    }

    fn build(name: String, config: CacheConfig, observer: Option<CacheObserver>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                config,
                version: AtomicU64::new(0),
                state: Mutex::new(CacheState {
                    entries: HashMap::with_capacity(config.capacity),
                    recency: BTreeMap::new(),
                    next_tick: 0,
                    stats: CacheStats::default(),
                }),
                loads: Mutex::new(HashMap::new()),
                runtime: Handle::try_current().ok(),
                debouncer: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                observer,
            }),
        }
    }

    /// Cache name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Current global version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Look up a valid entry
    ///
    /// Expired or stale entries are removed as a side effect. A hit marks the
    /// entry most recently used.
    pub fn get(&self, key: &str) -> Option<T> {
        let (value, result) = self.lookup(key);
        self.inner.emit(CacheEvent::Lookup(result));
        value
    }

    fn lookup(&self, key: &str) -> (Option<T>, CacheLookupResult) {
        let version = self.version();
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let verdict = match state.entries.get(key) {
            None => CacheLookupResult::Miss,
            Some(entry) if entry.version != version => CacheLookupResult::Stale,
            Some(entry) if now.saturating_duration_since(entry.stored_at) > self.inner.config.ttl => {
                CacheLookupResult::Expired
            }
            Some(_) => CacheLookupResult::Hit,
        };

        match verdict {
            CacheLookupResult::Miss => {
                state.stats.misses += 1;
                trace!(cache = %self.inner.name, key, "Cache miss");
                (None, verdict)
            }
            CacheLookupResult::Stale | CacheLookupResult::Expired => {
                state.remove(key);
                if verdict == CacheLookupResult::Stale {
                    state.stats.stale += 1;
                } else {
                    state.stats.expired += 1;
                }
                debug!(cache = %self.inner.name, key, result = verdict.as_str(), "Dropped invalid entry");
                (None, verdict)
            }
            CacheLookupResult::Hit => {
                let tick = state.bump_tick();
                let CacheState {
                    entries, recency, ..
                } = &mut *state;
                let value = entries.get_mut(key).map(|entry| {
                    recency.remove(&entry.tick);
                    recency.insert(tick, key.to_string());
                    entry.tick = tick;
                    entry.value.clone()
                });
                state.stats.hits += 1;
                trace!(cache = %self.inner.name, key, "Cache hit");
                (value, verdict)
            }
        }
    }

    /// Insert or overwrite an entry stamped with the current version
    pub fn set(&self, key: impl Into<String>, value: T) {
        self.store(key.into(), value, self.version());
    }

    fn store(&self, key: String, value: T, version: u64) {
        let mut evicted = 0usize;
        {
            let mut state = self.inner.state.lock();
            state.remove(&key);

            let tick = state.bump_tick();
            state.recency.insert(tick, key.clone());
            state.entries.insert(
                key,
                CacheEntry {
                    value,
                    stored_at: Instant::now(),
                    version,
                    tick,
                },
            );

            while state.entries.len() > self.inner.config.capacity {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                state.stats.evictions += 1;
                evicted += 1;
                debug!(cache = %self.inner.name, key = %oldest, "Evicted least recently used entry");
            }
        }

        for _ in 0..evicted {
            self.inner.emit(CacheEvent::Evicted);
        }
    }

    /// Return the cached value, or run `loader` once and cache its result
    ///
    /// The entry is stamped with the version observed before loading, so an
    /// invalidation that lands while the loader runs leaves it stale.
    ///
    /// # Errors
    /// Loader errors propagate unchanged and nothing is cached
    pub fn get_or_load<E, F>(&self, key: &str, loader: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let version = self.version();
        self.inner.state.lock().stats.loads += 1;
        let value = loader()?;
        self.store(key.to_string(), value.clone(), version);
        Ok(value)
    }

    /// Async variant of [`get_or_load`](Self::get_or_load)
    ///
    /// Concurrent misses on the same key are coalesced: one caller runs the
    /// loader, the others wait for it and then read the stored value. If the
    /// loader fails, the next waiter retries with its own loader.
    ///
    /// # Errors
    /// Loader errors propagate unchanged and nothing is cached
    pub async fn get_or_load_async<E, F, Fut>(&self, key: &str, loader: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let ticket = GateTicket::join(&self.inner.loads, key);
        let _guard = ticket.lock.lock().await;

        // Another caller may have finished loading while we waited.
        let (cached, lookup) = self.lookup(key);
        if let Some(value) = cached {
            self.inner.emit(CacheEvent::Lookup(lookup));
            return Ok(value);
        }

        let version = self.version();
        self.inner.state.lock().stats.loads += 1;
        let value = loader().await?;
        self.store(key.to_string(), value.clone(), version);
        Ok(value)
    }

    /// Keys with a load in progress or callers waiting on one
    #[must_use]
    pub fn pending_loads(&self) -> usize {
        self.inner.loads.lock().len()
    }

    /// Remove one entry
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.state.lock().remove(key).is_some()
    }

    /// Invalidate every entry in O(1)
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Remove every entry immediately
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.recency.clear();
        debug!(cache = %self.inner.name, "Cache cleared");
    }

    /// Record a change in the underlying data
    ///
    /// Restarts the debounce timer; `invalidate_all` runs once the timer
    /// elapses without further notifications. Safe to call from any thread:
    /// the timer runs on the runtime the cache was created in. A cache created
    /// outside a runtime falls back to the caller's runtime, and with neither
    /// it is invalidated immediately.
    pub fn notify_change(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let mut slot = self.inner.debouncer.lock();
        if slot.is_none() {
            let Some(handle) = self
                .inner
                .runtime
                .clone()
                .or_else(|| Handle::try_current().ok())
            else {
                drop(slot);
                self.invalidate_all();
                return;
            };
            let weak: Weak<CacheInner<T>> = Arc::downgrade(&self.inner);
            *slot = Some(Debouncer::spawn_on(
                &handle,
                format!("cache:{}", self.inner.name),
                self.inner.config.debounce,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.invalidate_all();
                    }
                },
            ));
        }

        if let Some(debouncer) = slot.as_ref() {
            debouncer.trigger();
        }
    }

    /// Stop the debounce timer and drop every entry
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        if let Some(debouncer) = self.inner.debouncer.lock().take() {
            debouncer.shutdown();
        }
        self.clear();
        info!(cache = %self.inner.name, "Cache destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Number of stored entries, including ones not yet pruned
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Whether no entries are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }
}
