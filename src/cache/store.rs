//! Keyed cache store.
//!
//! Maps structural [`CacheKey`]s to [`CacheEntry`] values. Every value write
//! takes the next version from a store-wide clock; staleness transitions keep
//! the value and the version. Listeners registered for a key run after each
//! write or staleness transition on that exact key, outside the store lock.
//! A listener never receives an entry older than one it has already been
//! handed, though two threads may still run the same listener concurrently.

use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use lru::LruCache;
use metrics::counter;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::{CacheEntry, EntryStatus, Version};
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::snapshot::{RollbackOutcome, SnapshotEntry};
use super::subscription::Subscription;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT_TOTAL: &str = "optimist_cache_evict_total";

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (store id, key) pairs whose listeners are running on this thread, and
    // whether a nested write to that key was held back meanwhile.
    static DISPATCHING: RefCell<HashMap<(u64, CacheKey), bool>> = RefCell::new(HashMap::new());
}

/// Callback invoked with the entry after each change to its key.
pub type Listener<V> = Arc<dyn Fn(&CacheEntry<V>) + Send + Sync>;

type EvictHook = Arc<dyn Fn(&CacheKey) + Send + Sync>;

struct Subscriber<V> {
    id: u64,
    listener: Listener<V>,
    /// Highest version handed to `listener` so far.
    delivered: AtomicU64,
}

impl<V> Subscriber<V> {
    fn deliver(&self, entry: &CacheEntry<V>) {
        let seen = self.delivered.fetch_max(entry.version, Ordering::SeqCst);
        if seen > entry.version {
            debug!(
                key = %entry.key,
                version = entry.version,
                delivered = seen,
                "Skipped out-of-order cache notification"
            );
            return;
        }
        (self.listener)(entry);
    }
}

struct Record<V> {
    entry: CacheEntry<V>,
    /// Fetch currently allowed to write this entry.
    fetch: Option<u64>,
}

struct StoreState<V> {
    records: LruCache<CacheKey, Record<V>>,
    listeners: HashMap<CacheKey, Vec<Arc<Subscriber<V>>>>,
    pins: HashMap<CacheKey, usize>,
    /// Keys dropped by the last trim, not yet reported to eviction hooks.
    evicted: Vec<CacheKey>,
}

struct StoreInner<V> {
    id: u64,
    capacity: Option<NonZeroUsize>,
    clock: AtomicU64,
    next_listener: AtomicU64,
    state: Mutex<StoreState<V>>,
    evict_hooks: Mutex<Vec<EvictHook>>,
}

impl<V> StoreInner<V> {
    fn remove_listener(&self, key: &CacheKey, listener_id: u64) {
        let mut state = mutex_lock(&self.state, SOURCE, "unsubscribe");
        if let Some(listeners) = state.listeners.get_mut(key) {
            listeners.retain(|subscriber| subscriber.id != listener_id);
            if listeners.is_empty() {
                state.listeners.remove(key);
            }
        }
    }

    fn listeners_for(state: &StoreState<V>, key: &CacheKey) -> Vec<Arc<Subscriber<V>>> {
        state.listeners.get(key).cloned().unwrap_or_default()
    }

    /// Report keys that left the store. Runs outside the store lock.
    fn notify_evicted(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        let hooks: Vec<EvictHook> = mutex_lock(&self.evict_hooks, SOURCE, "notify_evicted")
            .iter()
            .map(Arc::clone)
            .collect();
        for key in keys {
            for hook in &hooks {
                hook(key);
            }
        }
    }
}

/// Shared handle to the keyed cache.
pub struct QueryStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for QueryStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A change already applied under the store lock whose listeners have not
/// run yet.
#[must_use = "listeners only run when the dispatch is run"]
pub(crate) struct Dispatch<V> {
    store: Weak<StoreInner<V>>,
    store_id: u64,
    entry: CacheEntry<V>,
    listeners: Vec<Arc<Subscriber<V>>>,
    evicted: Vec<CacheKey>,
}

impl<V: Clone> Dispatch<V> {
    pub(crate) fn run(self) -> CacheEntry<V> {
        if !self.evicted.is_empty() {
            if let Some(inner) = self.store.upgrade() {
                inner.notify_evicted(&self.evicted);
            }
        }

        if self.listeners.is_empty() {
            return self.entry;
        }

        let Some(guard) = DispatchGuard::enter(self.store_id, &self.entry.key) else {
            // A listener of this key wrote to it synchronously. The write
            // stands; the outer dispatch delivers the final entry once.
            warn!(
                key = %self.entry.key,
                version = self.entry.version,
                "Deferred re-entrant cache notification"
            );
            DispatchGuard::mark_pending(self.store_id, &self.entry.key);
            return self.entry;
        };

        for subscriber in &self.listeners {
            subscriber.deliver(&self.entry);
        }

        if guard.take_pending() {
            if let Some(inner) = self.store.upgrade() {
                let latest = {
                    let state = mutex_lock(&inner.state, SOURCE, "redeliver");
                    state.records.peek(&self.entry.key).map(|record| {
                        (
                            record.entry.clone(),
                            StoreInner::listeners_for(&state, &self.entry.key),
                        )
                    })
                };
                if let Some((entry, listeners)) = latest {
                    for subscriber in &listeners {
                        subscriber.deliver(&entry);
                    }
                }
            }
        }

        self.entry
    }
}

struct DispatchGuard {
    token: (u64, CacheKey),
}

impl DispatchGuard {
    fn enter(store_id: u64, key: &CacheKey) -> Option<Self> {
        let token = (store_id, key.clone());
        let entered = DISPATCHING.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains_key(&token) {
                false
            } else {
                active.insert(token.clone(), false);
                true
            }
        });
        entered.then_some(Self { token })
    }

    fn mark_pending(store_id: u64, key: &CacheKey) {
        DISPATCHING.with(|active| {
            if let Some(pending) = active.borrow_mut().get_mut(&(store_id, key.clone())) {
                *pending = true;
            }
        });
    }

    fn take_pending(&self) -> bool {
        DISPATCHING.with(|active| {
            active
                .borrow_mut()
                .get_mut(&self.token)
                .map(std::mem::take)
                .unwrap_or(false)
        })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|active| {
            active.borrow_mut().remove(&self.token);
        });
    }
}

impl<V: Clone> QueryStore<V> {
    /// Create an empty store with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                capacity: config.capacity(),
                clock: AtomicU64::new(0),
                next_listener: AtomicU64::new(1),
                state: Mutex::new(StoreState {
                    records: LruCache::unbounded(),
                    listeners: HashMap::new(),
                    pins: HashMap::new(),
                    evicted: Vec::new(),
                }),
                evict_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        mutex_lock(&self.inner.state, SOURCE, "get")
            .records
            .get(key)
            .map(|record| record.entry.clone())
    }

    /// Current value for `key`, if any.
    pub fn value(&self, key: &CacheKey) -> Option<V> {
        self.get(key).and_then(|entry| entry.value)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        mutex_lock(&self.inner.state, SOURCE, "keys")
            .records
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "subscriber_count")
            .listeners
            .get(key)
            .map_or(0, Vec::len)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a value, bump the version, and mark the entry idle.
    pub fn set(&self, key: CacheKey, value: V) -> CacheEntry<V> {
        self.write(key, |_| Some(value)).run()
    }

    /// Read-modify-write under the store lock.
    ///
    /// `transform` runs while the store is locked and must not call back into
    /// the store.
    pub fn update<F>(&self, key: CacheKey, transform: F) -> CacheEntry<V>
    where
        F: FnOnce(Option<&V>) -> V,
    {
        self.write(key, |old| Some(transform(old))).run()
    }

    /// Like [`update`](Self::update), but only when `key` already holds a
    /// value. Returns `None` and leaves the store untouched otherwise.
    pub fn update_existing<F>(&self, key: &CacheKey, transform: F) -> Option<CacheEntry<V>>
    where
        F: FnOnce(&V) -> V,
    {
        let dispatch = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "update_existing");
            let state = &mut *guard;
            let record = state.records.get_mut(key)?;
            let old = record.entry.value.as_ref()?;
            let value = transform(old);
            let version = self.next_version();
            Self::write_record(record, Some(value), version);
            let entry = record.entry.clone();
            self.finish(state, entry)
        };
        Some(dispatch.run())
    }

    /// Flag `key` as stale without touching its value or version.
    ///
    /// Creates a value-less stale placeholder when the key is unknown. Any
    /// fetch in flight for the key loses the right to write its result.
    pub fn mark_stale(&self, key: &CacheKey) -> CacheEntry<V> {
        let dispatch = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "mark_stale");
            let state = &mut *guard;
            let entry = Self::stale_record(&mut state.records, key);
            self.trim(state, key);
            self.finish(state, entry)
        };
        dispatch.run()
    }

    /// Mark `prefix` itself and every cached key it is a prefix of as stale.
    ///
    /// Returns the affected keys, `prefix` first.
    pub fn invalidate(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let dispatches = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "invalidate");
            let state = &mut *guard;

            let mut keys = vec![prefix.clone()];
            keys.extend(
                state
                    .records
                    .iter()
                    .map(|(key, _)| key)
                    .filter(|key| *key != prefix && prefix.is_prefix_of(key))
                    .cloned(),
            );

            let entries: Vec<CacheEntry<V>> = keys
                .iter()
                .map(|key| Self::stale_record(&mut state.records, key))
                .collect();
            self.trim(state, prefix);
            let dispatches: Vec<Dispatch<V>> = entries
                .into_iter()
                .map(|entry| self.finish(state, entry))
                .collect();
            dispatches
        };

        dispatches
            .into_iter()
            .map(|dispatch| dispatch.run().key)
            .collect()
    }

    /// Register `listener` for changes to `key`.
    pub fn subscribe<F>(&self, key: CacheKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEntry<V>) + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.inner.state, SOURCE, "subscribe")
            .listeners
            .entry(key.clone())
            .or_default()
            .push(Arc::new(Subscriber {
                id: listener_id,
                listener: Arc::new(listener),
                delivered: AtomicU64::new(0),
            }));

        let store = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = store.upgrade() {
                inner.remove_listener(&key, listener_id);
            }
        })
    }

    /// Drop every entry. Listeners stay registered and the version clock keeps
    /// running, so later writes still outrank anything delivered before.
    ///
    /// Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let dropped: Vec<CacheKey> = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
            let keys = state.records.iter().map(|(key, _)| key.clone()).collect();
            state.records.clear();
            keys
        };
        debug!(entries = dropped.len(), "Cleared cache");
        self.inner.notify_evicted(&dropped);
        dropped.len()
    }

    // ========================================================================
    // Coordinator hooks
    // ========================================================================

    /// Call `hook` with each key that leaves the store through eviction or
    /// [`clear`](Self::clear).
    pub(crate) fn on_evict<F>(&self, hook: F)
    where
        F: Fn(&CacheKey) + Send + Sync + 'static,
    {
        mutex_lock(&self.inner.evict_hooks, SOURCE, "on_evict").push(Arc::new(hook));
    }

    /// Write back a snapshotted value if nothing wrote to the key since the
    /// snapshot owner's own optimistic write.
    pub(crate) fn restore(&self, snapshot: &SnapshotEntry<V>) -> RollbackOutcome {
        let Some(written) = snapshot.written else {
            return RollbackOutcome::Untouched;
        };

        let dispatch = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "restore");
            let state = &mut *guard;
            match state.records.get_mut(&snapshot.key) {
                Some(record) if record.entry.version == written => {
                    let version = self.next_version();
                    Self::write_record(record, snapshot.value.clone(), version);
                    record.entry.updated_at = snapshot.updated_at;
                    let entry = record.entry.clone();
                    Some(self.finish(state, entry))
                }
                _ => None,
            }
        };

        match dispatch {
            Some(dispatch) => {
                dispatch.run();
                RollbackOutcome::Restored
            }
            None => RollbackOutcome::StaleSnapshotDiscarded,
        }
    }

    pub(crate) fn pin(&self, key: &CacheKey) {
        *mutex_lock(&self.inner.state, SOURCE, "pin")
            .pins
            .entry(key.clone())
            .or_default() += 1;
    }

    pub(crate) fn unpin(&self, key: &CacheKey) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "unpin");
        if let Some(count) = state.pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(key);
            }
        }
    }

    /// Hand `key` to fetch `fetch_id` and flag it as fetching.
    pub(crate) fn begin_fetch(&self, key: &CacheKey, fetch_id: u64) -> Dispatch<V> {
        let mut guard = mutex_lock(&self.inner.state, SOURCE, "begin_fetch");
        let state = &mut *guard;
        let record = state
            .records
            .get_or_insert_mut(key.clone(), || Record {
                entry: CacheEntry::vacant(key.clone()),
                fetch: None,
            });
        record.fetch = Some(fetch_id);
        record.entry.status = EntryStatus::Fetching;
        let entry = record.entry.clone();
        self.trim(state, key);
        self.finish(state, entry)
    }

    /// Fetch currently allowed to write `key`, if any.
    pub(crate) fn fetch_owner(&self, key: &CacheKey) -> Option<u64> {
        mutex_lock(&self.inner.state, SOURCE, "fetch_owner")
            .records
            .peek(key)
            .and_then(|record| record.fetch)
    }

    /// Store a fetched value unless another write superseded the fetch.
    pub(crate) fn complete_fetch(&self, key: &CacheKey, fetch_id: u64, value: V) -> bool {
        let dispatch = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "complete_fetch");
            let state = &mut *guard;
            match state.records.peek_mut(key) {
                Some(record) if record.fetch == Some(fetch_id) => {
                    let version = self.next_version();
                    Self::write_record(record, Some(value), version);
                    let entry = record.entry.clone();
                    Some(self.finish(state, entry))
                }
                _ => None,
            }
        };
        dispatch.map(Dispatch::run).is_some()
    }

    /// Return a failed fetch's entry to idle, keeping its prior value.
    pub(crate) fn abort_fetch(&self, key: &CacheKey, fetch_id: u64) {
        let dispatch = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "abort_fetch");
            let state = &mut *guard;
            match state.records.peek_mut(key) {
                Some(record) if record.fetch == Some(fetch_id) => {
                    record.fetch = None;
                    record.entry.status = EntryStatus::Idle;
                    let entry = record.entry.clone();
                    Some(self.finish(state, entry))
                }
                _ => None,
            }
        };
        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn next_version(&self) -> Version {
        self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&self, key: CacheKey, produce: impl FnOnce(Option<&V>) -> Option<V>) -> Dispatch<V> {
        let mut guard = mutex_lock(&self.inner.state, SOURCE, "write");
        let state = &mut *guard;
        let version = self.next_version();
        let record = state.records.get_or_insert_mut(key.clone(), || Record {
            entry: CacheEntry::vacant(key.clone()),
            fetch: None,
        });
        let value = produce(record.entry.value.as_ref());
        Self::write_record(record, value, version);
        let entry = record.entry.clone();
        self.trim(state, &key);
        self.finish(state, entry)
    }

    fn write_record(record: &mut Record<V>, value: Option<V>, version: Version) {
        record.fetch = None;
        record.entry.value = value;
        record.entry.version = version;
        record.entry.status = EntryStatus::Idle;
        record.entry.updated_at = Some(Instant::now());
    }

    fn stale_record(records: &mut LruCache<CacheKey, Record<V>>, key: &CacheKey) -> CacheEntry<V> {
        let record = records.get_or_insert_mut(key.clone(), || Record {
            entry: CacheEntry::vacant(key.clone()),
            fetch: None,
        });
        record.fetch = None;
        record.entry.status = EntryStatus::Stale;
        record.entry.clone()
    }

    fn finish(&self, state: &mut StoreState<V>, entry: CacheEntry<V>) -> Dispatch<V> {
        let listeners = StoreInner::listeners_for(state, &entry.key);
        Dispatch {
            store: Arc::downgrade(&self.inner),
            store_id: self.inner.id,
            entry,
            listeners,
            evicted: std::mem::take(&mut state.evicted),
        }
    }

    /// Evict least-recently-used entries over capacity, skipping `keep` and
    /// any entry that is subscribed, fetching, or pinned by a snapshot.
    fn trim(&self, state: &mut StoreState<V>, keep: &CacheKey) {
        let Some(limit) = self.inner.capacity else {
            return;
        };

        while state.records.len() > limit.get() {
            let listeners = &state.listeners;
            let pins = &state.pins;
            let victim = state
                .records
                .iter()
                .rev()
                .find(|(key, record)| {
                    *key != keep
                        && record.fetch.is_none()
                        && !listeners.contains_key(*key)
                        && !pins.contains_key(*key)
                })
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else {
                debug!(
                    len = state.records.len(),
                    limit = limit.get(),
                    "Cache over capacity with no evictable entries"
                );
                break;
            };

            state.records.pop(&victim);
            counter!(METRIC_CACHE_EVICT_TOTAL).increment(1);
            debug!(key = %victim, "Evicted cache entry");
            state.evicted.push(victim);
        }
    }
}
