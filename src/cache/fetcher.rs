//! Fetcher binding.
//!
//! Puts a loader behind a key so concurrent reads of the same key share one
//! call and successful results land in the store. Loaders are remembered per
//! key so invalidation can refresh the key in the background, and forgotten
//! once the store drops the key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use tokio::runtime::Handle;
use tracing::debug;

use super::config::CacheConfig;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::store::QueryStore;

const SOURCE: &str = "cache::fetcher";
const METRIC_CACHE_HIT_TOTAL: &str = "optimist_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "optimist_cache_miss_total";
const METRIC_FETCH_JOIN_TOTAL: &str = "optimist_fetch_join_total";

pub type LoadFuture<V, E> = BoxFuture<'static, Result<V, E>>;

/// Produces a fresh load of one key each time it is called.
pub type Loader<V, E> = Arc<dyn Fn() -> LoadFuture<V, E> + Send + Sync>;

/// A fetch in flight, awaitable by any number of readers.
pub(crate) type PendingLoad<V, E> = Shared<LoadFuture<V, E>>;

enum Acquired<V, E> {
    Cached(V),
    Pending(PendingLoad<V, E>),
}

struct FetcherInner<V, E> {
    store: QueryStore<V>,
    loaders: Arc<DashMap<CacheKey, Loader<V, E>>>,
    in_flight: Mutex<HashMap<CacheKey, (u64, PendingLoad<V, E>)>>,
    next_fetch: AtomicU64,
    stale_after: Option<Duration>,
}

pub struct Fetcher<V, E> {
    inner: Arc<FetcherInner<V, E>>,
}

impl<V, E> Clone for Fetcher<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Fetcher<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(store: QueryStore<V>, config: &CacheConfig) -> Self {
        let loaders: Arc<DashMap<CacheKey, Loader<V, E>>> = Arc::new(DashMap::new());
        let registry = Arc::downgrade(&loaders);
        store.on_evict(move |key| {
            if let Some(loaders) = registry.upgrade() {
                if loaders.remove(key).is_some() {
                    debug!(key = %key, "Dropped loader of evicted key");
                }
            }
        });

        Self {
            inner: Arc::new(FetcherInner {
                store,
                loaders,
                in_flight: Mutex::new(HashMap::new()),
                next_fetch: AtomicU64::new(1),
                stale_after: config.stale_after(),
            }),
        }
    }

    pub fn store(&self) -> &QueryStore<V> {
        &self.inner.store
    }

    /// Return the cached value for `key` when it is fresh, join the fetch in
    /// flight when there is one, and otherwise call `loader`.
    ///
    /// A failed load leaves the entry idle with its prior value and hands the
    /// error to every reader that joined it. `loader` becomes the key's
    /// registered loader for later refreshes.
    pub async fn read<F, Fut>(&self, key: CacheKey, loader: F) -> Result<V, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let loader: Loader<V, E> = Arc::new(move || loader().boxed());
        self.inner.loaders.insert(key.clone(), Arc::clone(&loader));
        self.load(key, loader).await
    }

    pub fn loader(&self, key: &CacheKey) -> Option<Loader<V, E>> {
        self.inner
            .loaders
            .get(key)
            .map(|loader| Arc::clone(loader.value()))
    }

    /// Whether a fetch that may still write `key` is running.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        let in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "is_fetching");
        in_flight.get(key).is_some_and(|(fetch_id, _)| {
            self.inner.store.fetch_owner(key) == Some(*fetch_id)
        })
    }

    /// Start a background load of `key` through its registered loader.
    ///
    /// Returns `None` when no loader is registered. A fresh entry is not
    /// reloaded; the returned future then resolves to the cached value.
    pub(crate) fn refresh(&self, key: &CacheKey) -> Option<PendingLoad<V, E>> {
        let loader = self.loader(key)?;
        Some(match self.acquire(key, loader) {
            Acquired::Cached(value) => futures::future::ready(Ok(value)).boxed().shared(),
            Acquired::Pending(pending) => pending,
        })
    }

    pub(crate) async fn load(&self, key: CacheKey, loader: Loader<V, E>) -> Result<V, E> {
        match self.acquire(&key, loader) {
            Acquired::Cached(value) => Ok(value),
            Acquired::Pending(pending) => pending.await,
        }
    }

    fn acquire(&self, key: &CacheKey, loader: Loader<V, E>) -> Acquired<V, E> {
        let store = &self.inner.store;
        let (dispatch, pending) = {
            let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "acquire");

            if let Some(entry) = store.get(key) {
                if entry.is_fresh(self.inner.stale_after) {
                    if let Some(value) = entry.value {
                        counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                        debug!(key = %key, version = entry.version, "Cache hit");
                        return Acquired::Cached(value);
                    }
                }
            }

            if let Some((fetch_id, pending)) = in_flight.get(key) {
                if store.fetch_owner(key) == Some(*fetch_id) {
                    counter!(METRIC_FETCH_JOIN_TOTAL).increment(1);
                    debug!(key = %key, fetch_id, "Joined fetch in flight");
                    return Acquired::Pending(pending.clone());
                }
            }

            counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
            let fetch_id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, fetch_id, "Cache miss, fetching");

            let dispatch = store.begin_fetch(key, fetch_id);
            let pending = self.fetch(key.clone(), fetch_id, loader).shared();
            in_flight.insert(key.clone(), (fetch_id, pending.clone()));
            (dispatch, pending)
        };

        dispatch.run();

        // Drive the fetch to completion even if every reader goes away.
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pending.clone());
            }
            Err(_) => debug!(key = %key, "No runtime; fetch runs when awaited"),
        }

        Acquired::Pending(pending)
    }

    fn fetch(&self, key: CacheKey, fetch_id: u64, loader: Loader<V, E>) -> LoadFuture<V, E> {
        let fetcher = Arc::downgrade(&self.inner);
        let store = self.inner.store.clone();

        async move {
            let result = loader().await;

            match &result {
                Ok(value) => {
                    if !store.complete_fetch(&key, fetch_id, value.clone()) {
                        debug!(key = %key, fetch_id, "Fetch superseded, result not stored");
                    }
                }
                Err(_) => {
                    store.abort_fetch(&key, fetch_id);
                    debug!(key = %key, fetch_id, "Fetch failed");
                }
            }

            if let Some(inner) = fetcher.upgrade() {
                let mut in_flight = mutex_lock(&inner.in_flight, SOURCE, "release");
                if in_flight.get(&key).is_some_and(|(id, _)| *id == fetch_id) {
                    in_flight.remove(&key);
                }
            }

            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::entry::EntryStatus;

    fn key(id: &str) -> CacheKey {
        CacheKey::new(["article", id])
    }

    fn fetcher(config: &CacheConfig) -> Fetcher<u32, String> {
        Fetcher::new(QueryStore::new(config), config)
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, String>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_load() {
        let fetcher = fetcher(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let (first, second) = tokio::join!(
            fetcher.read(key("a1"), counting_loader(&calls, 7)),
            fetcher.read(key("a1"), counting_loader(&calls, 8)),
        );

        assert_eq!(first, Ok(7));
        assert_eq!(second, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.store().value(&key("a1")), Some(7));
    }

    #[tokio::test]
    async fn fresh_entries_skip_the_loader() {
        let fetcher = fetcher(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        fetcher.store().set(key("a1"), 3);

        let value = fetcher.read(key("a1"), counting_loader(&calls, 9)).await;

        assert_eq!(value, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(fetcher.loader(&key("a1")).is_some());
    }

    #[tokio::test]
    async fn stale_entries_reload() {
        let fetcher = fetcher(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        fetcher.store().set(key("a1"), 3);
        fetcher.store().mark_stale(&key("a1"));

        let value = fetcher.read(key("a1"), counting_loader(&calls, 4)).await;

        assert_eq!(value, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entry = fetcher.store().get(&key("a1")).expect("entry");
        assert_eq!(entry.status, EntryStatus::Idle);
    }

    #[tokio::test]
    async fn aged_entries_reload() {
        let fetcher = fetcher(&CacheConfig {
            stale_after_ms: 1,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        fetcher
            .read(key("a1"), counting_loader(&calls, 1))
            .await
            .expect("first load");
        tokio::time::sleep(Duration::from_millis(5)).await;
        fetcher
            .read(key("a1"), counting_loader(&calls, 2))
            .await
            .expect("second load");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let fetcher = fetcher(&CacheConfig::default());
        fetcher.store().set(key("a1"), 3);
        fetcher.store().mark_stale(&key("a1"));

        let result = fetcher
            .read(key("a1"), || async { Err::<u32, _>("offline".to_string()) })
            .await;
        assert_eq!(result, Err("offline".to_string()));

        let entry = fetcher.store().get(&key("a1")).expect("entry kept");
        assert_eq!(entry.status, EntryStatus::Idle);
        assert_eq!(entry.value, Some(3));
        assert!(!fetcher.is_fetching(&key("a1")));
    }

    #[tokio::test]
    async fn failed_first_load_leaves_no_value() {
        let fetcher = fetcher(&CacheConfig::default());

        let result = fetcher
            .read(key("a1"), || async { Err::<u32, _>("offline".to_string()) })
            .await;
        assert!(result.is_err());

        let calls = Arc::new(AtomicUsize::new(0));
        let value = fetcher.read(key("a1"), counting_loader(&calls, 6)).await;
        assert_eq!(value, Ok(6));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn superseded_fetch_keeps_newer_write() {
        let fetcher = fetcher(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let reader = fetcher.clone();
        let loader = counting_loader(&calls, 1);
        let handle = tokio::spawn(async move { reader.read(key("a1"), loader).await });
        tokio::task::yield_now().await;
        assert!(fetcher.is_fetching(&key("a1")));

        fetcher.store().set(key("a1"), 5);
        assert!(!fetcher.is_fetching(&key("a1")));

        let result = handle.await.expect("reader task");
        assert_eq!(result, Ok(1));
        assert_eq!(fetcher.store().value(&key("a1")), Some(5));
    }

    #[tokio::test]
    async fn evicted_keys_forget_their_loader() {
        let fetcher = fetcher(&CacheConfig {
            max_entries: 1,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        fetcher
            .read(key("a1"), counting_loader(&calls, 1))
            .await
            .expect("first key");
        fetcher
            .read(key("b2"), counting_loader(&calls, 2))
            .await
            .expect("second key");

        assert!(fetcher.store().get(&key("a1")).is_none());
        assert!(fetcher.loader(&key("a1")).is_none());
        assert!(fetcher.loader(&key("b2")).is_some());
        assert!(fetcher.refresh(&key("a1")).is_none());
    }

    #[tokio::test]
    async fn cleared_store_forgets_every_loader() {
        let fetcher = fetcher(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        fetcher
            .read(key("a1"), counting_loader(&calls, 1))
            .await
            .expect("loaded");

        fetcher.store().clear();

        assert!(fetcher.loader(&key("a1")).is_none());
    }

    #[tokio::test]
    async fn refresh_uses_registered_loader() {
        let fetcher = fetcher(&CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(fetcher.refresh(&key("a1")).is_none());

        fetcher
            .read(key("a1"), counting_loader(&calls, 2))
            .await
            .expect("initial load");
        fetcher.store().mark_stale(&key("a1"));

        let pending = fetcher.refresh(&key("a1")).expect("loader registered");
        assert_eq!(pending.await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!fetcher.store().get(&key("a1")).expect("entry").is_stale());
    }
}
