//! Mutation coordinator.
//!
//! A [`Mutation`] bundles a server operation with the optimistic writes it
//! implies and the keys its settlement invalidates. [`Coordinator::run`]
//! drives one mutation through snapshot, optimistic apply, the operation
//! itself, rollback-if-current on failure, and invalidation with background
//! refresh. Everything after the optimistic apply runs on its own task.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use super::fetcher::Fetcher;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::notice::NoticeBoard;
use super::snapshot::{RollbackOutcome, Snapshot};
use super::store::QueryStore;

const SOURCE: &str = "cache::mutation";
const METRIC_MUTATION_TOTAL: &str = "optimist_mutation_total";
const METRIC_MUTATION_MS: &str = "optimist_mutation_ms";
const METRIC_ROLLBACK_TOTAL: &str = "optimist_rollback_total";
const METRIC_REFRESH_FAILED_TOTAL: &str = "optimist_refresh_failed_total";

type Transform<V> = Box<dyn FnOnce(&V) -> V + Send>;

/// One state-changing operation plus its cache bookkeeping.
pub struct Mutation<V, R, E> {
    id: Uuid,
    category: String,
    target: CacheKey,
    optimistic: Option<(V, Transform<V>)>,
    related: Vec<(CacheKey, Transform<V>)>,
    dependents: Vec<CacheKey>,
    clears_cache: bool,
    operation: BoxFuture<'static, Result<R, E>>,
}

/// What the settlement task owns once the optimistic writes are in place.
struct Settlement<V: Clone, R, E> {
    operation: BoxFuture<'static, Result<R, E>>,
    snapshot: Snapshot<V>,
    keys: Vec<CacheKey>,
    clears_cache: bool,
    started: Instant,
}

impl<V, R, E> Mutation<V, R, E> {
    /// A mutation of `category` aimed at `target`. Without
    /// [`optimistic`](Self::optimistic) it writes nothing before `operation`
    /// settles.
    pub fn new<Fut>(category: impl Into<String>, target: CacheKey, operation: Fut) -> Self
    where
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            target,
            optimistic: None,
            related: Vec::new(),
            dependents: Vec::new(),
            clears_cache: false,
            operation: operation.boxed(),
        }
    }

    /// Speculative write applied to the target before the operation runs.
    /// `transform` sees `placeholder` when the target holds no value.
    pub fn optimistic<F>(mut self, placeholder: V, transform: F) -> Self
    where
        F: FnOnce(&V) -> V + Send + 'static,
    {
        self.optimistic = Some((placeholder, Box::new(transform)));
        self
    }

    /// Speculative write to another key, applied only when that key already
    /// holds a value.
    pub fn also_update<F>(mut self, key: CacheKey, transform: F) -> Self
    where
        F: FnOnce(&V) -> V + Send + 'static,
    {
        self.related.push((key, Box::new(transform)));
        self
    }

    /// Keys to mark stale and refresh once the mutation settles.
    pub fn invalidates<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = CacheKey>,
    {
        for key in keys {
            if !self.dependents.contains(&key) {
                self.dependents.push(key);
            }
        }
        self
    }

    /// Drop every cached entry once the operation succeeds, instead of
    /// invalidating. A failure still rolls back and invalidates as usual.
    pub fn clear_on_success(mut self) -> Self {
        self.clears_cache = true;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn target(&self) -> &CacheKey {
        &self.target
    }

    pub fn dependents(&self) -> &[CacheKey] {
        &self.dependents
    }

    /// Every key settlement invalidates: the target, each related key, then
    /// the declared dependents, without repeats.
    fn settlement_keys(&self) -> Vec<CacheKey> {
        let mut keys = vec![self.target.clone()];
        let candidates = self
            .related
            .iter()
            .map(|(key, _)| key)
            .chain(&self.dependents);
        for key in candidates {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

impl<V, R, E> fmt::Debug for Mutation<V, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("target", &self.target)
            .field("optimistic", &self.optimistic.is_some())
            .field(
                "related",
                &self.related.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .field("dependents", &self.dependents)
            .field("clears_cache", &self.clears_cache)
            .finish_non_exhaustive()
    }
}

/// Keys touched by one invalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Keys marked stale, including cached keys covered by a prefix.
    pub stale: Vec<CacheKey>,
    /// Stale keys with a registered loader, now refreshing in the background.
    pub refreshing: Vec<CacheKey>,
}

struct CoordinatorInner<V, E> {
    fetcher: Fetcher<V, E>,
    notices: NoticeBoard,
    refreshes: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Coordinator<V, E> {
    inner: Arc<CoordinatorInner<V, E>>,
}

impl<V, E> Clone for Coordinator<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Coordinator<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    pub fn new(fetcher: Fetcher<V, E>, notices: NoticeBoard) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                fetcher,
                notices,
                refreshes: Mutex::new(Vec::new()),
            }),
        }
    }

    fn store(&self) -> &QueryStore<V> {
        self.inner.fetcher.store()
    }

    /// Run `mutation` to settlement and return the operation's own result.
    ///
    /// On failure each optimistically written key is restored only while it
    /// still carries the version this mutation wrote; a newer write wins.
    /// Success or failure, every settlement key is then invalidated.
    ///
    /// The optimistic writes land on the first poll. The operation and the
    /// settlement then run on their own task, so dropping the returned future
    /// does not cancel the server call or skip the rollback and invalidation.
    #[instrument(
        name = "mutation",
        skip_all,
        fields(
            mutation_id = %mutation.id,
            category = %mutation.category,
            target = %mutation.target,
        )
    )]
    pub async fn run<R, OE>(&self, mutation: Mutation<V, R, OE>) -> Result<R, OE>
    where
        R: Send + 'static,
        OE: Send + 'static,
    {
        let started = Instant::now();
        let settlement_keys = mutation.settlement_keys();
        let clears_cache = mutation.clears_cache;
        let Mutation {
            id,
            target,
            optimistic,
            related,
            dependents,
            operation,
            ..
        } = mutation;
        let store = self.store();

        let mut snapshot = Snapshot::capture(
            store,
            id,
            &target,
            related.iter().map(|(key, _)| key).chain(&dependents),
        );

        if let Some((placeholder, transform)) = optimistic {
            let entry = store.update(target.clone(), move |current| {
                transform(current.unwrap_or(&placeholder))
            });
            snapshot.record_write(&target, entry.version);
            debug!(key = %target, version = entry.version, "Applied optimistic write");
        }

        for (key, transform) in related {
            match store.update_existing(&key, transform) {
                Some(entry) => {
                    snapshot.record_write(&key, entry.version);
                    debug!(key = %key, version = entry.version, "Applied optimistic write");
                }
                None => debug!(key = %key, "Related key not cached, skipped"),
            }
        }

        let settlement = self
            .clone()
            .settle(Settlement {
                operation,
                snapshot,
                keys: settlement_keys,
                clears_cache,
                started,
            })
            .in_current_span();

        let Ok(handle) = Handle::try_current() else {
            debug!("No async runtime; settling in the caller");
            return settlement.await;
        };

        match handle.spawn(settlement).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                // Only runtime shutdown cancels the task, and the caller goes
                // down with the runtime.
                warn!(error = %err, "Settlement task cancelled");
                std::future::pending().await
            }
        }
    }

    async fn settle<R, OE>(self, settlement: Settlement<V, R, OE>) -> Result<R, OE> {
        let Settlement {
            operation,
            snapshot,
            keys,
            clears_cache,
            started,
        } = settlement;

        let result = operation.await;

        let outcome = match &result {
            Ok(_) => {
                snapshot.discard();
                "success"
            }
            Err(_) => {
                for (key, rollback) in snapshot.restore() {
                    match rollback {
                        RollbackOutcome::Restored => {
                            debug!(key = %key, "Rolled back optimistic write");
                        }
                        RollbackOutcome::StaleSnapshotDiscarded => {
                            warn!(key = %key, "Skipped rollback; a newer write superseded it");
                        }
                        RollbackOutcome::Untouched => continue,
                    }
                    counter!(METRIC_ROLLBACK_TOTAL, "result" => rollback.as_str()).increment(1);
                }
                "failure"
            }
        };

        let report = if clears_cache && result.is_ok() {
            let cleared = self.store().clear();
            info!(cleared, "Cleared cache after mutation");
            InvalidationReport::default()
        } else {
            self.invalidate(&keys)
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        counter!(METRIC_MUTATION_TOTAL, "outcome" => outcome).increment(1);
        histogram!(METRIC_MUTATION_MS).record(elapsed_ms);
        info!(
            outcome,
            stale = report.stale.len(),
            refreshing = report.refreshing.len(),
            elapsed_ms,
            "Mutation settled"
        );

        result
    }

    /// Mark each key (and every cached key it prefixes) stale, then refresh
    /// each affected key with a registered loader exactly once.
    pub fn invalidate(&self, keys: &[CacheKey]) -> InvalidationReport {
        let mut stale: Vec<CacheKey> = Vec::new();
        for key in keys {
            for affected in self.store().invalidate(key) {
                if !stale.contains(&affected) {
                    stale.push(affected);
                }
            }
        }

        let refreshing = stale
            .iter()
            .filter(|key| self.schedule_refresh(key))
            .cloned()
            .collect();

        InvalidationReport { stale, refreshing }
    }

    fn schedule_refresh(&self, key: &CacheKey) -> bool {
        let Ok(handle) = Handle::try_current() else {
            warn!(key = %key, "No async runtime; refresh deferred to next read");
            return false;
        };
        let Some(pending) = self.inner.fetcher.refresh(key) else {
            return false;
        };

        let notices = self.inner.notices.clone();
        let refresh_key = key.clone();
        let span = info_span!("refresh", key = %key);
        let task = handle.spawn(
            async move {
                match pending.await {
                    Ok(_) => debug!("Background refresh stored"),
                    Err(err) => {
                        counter!(METRIC_REFRESH_FAILED_TOTAL).increment(1);
                        warn!(error = %err, "Background refresh failed");
                        notices.error(format!("Could not refresh {refresh_key}: {err}"));
                    }
                }
            }
            .instrument(span),
        );

        let mut refreshes = mutex_lock(&self.inner.refreshes, SOURCE, "schedule_refresh");
        refreshes.retain(|task| !task.is_finished());
        refreshes.push(task);
        true
    }

    /// Wait for every background refresh scheduled so far, including ones
    /// scheduled while waiting. Returns how many were awaited.
    pub async fn flush_refreshes(&self) -> usize {
        let mut flushed = 0;
        loop {
            let tasks = std::mem::take(&mut *mutex_lock(
                &self.inner.refreshes,
                SOURCE,
                "flush_refreshes",
            ));
            if tasks.is_empty() {
                return flushed;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(error = %err, "Refresh task ended abnormally");
                }
                flushed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::entry::EntryStatus;
    use crate::cache::notice::NoticeLevel;

    fn coordinator() -> Coordinator<u32, String> {
        let config = CacheConfig::default();
        let fetcher = Fetcher::new(QueryStore::new(&config), &config);
        Coordinator::new(fetcher, NoticeBoard::new(&config))
    }

    fn key(kind: &str, id: &str) -> CacheKey {
        CacheKey::new([kind, id])
    }

    fn fails() -> impl Future<Output = Result<(), String>> + Send + 'static {
        async { Err("offline".to_string()) }
    }

    #[tokio::test]
    async fn placeholder_feeds_transform_for_absent_target() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel::<Result<(), String>>();

        let mutation = Mutation::new("count", key("like", "a1"), async move {
            rx.await.unwrap_or_else(|_| Err("dropped".to_string()))
        })
        .optimistic(0, |count| count + 1);

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(mutation).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(coordinator.store().value(&key("like", "a1")), Some(1));

        tx.send(Ok(())).expect("mutation still pending");
        running.await.expect("task").expect("operation succeeded");
        let entry = coordinator.store().get(&key("like", "a1")).expect("entry");
        assert_eq!(entry.value, Some(1));
        assert_eq!(entry.status, EntryStatus::Stale);
    }

    #[tokio::test]
    async fn failure_restores_related_keys_and_returns_error() {
        let coordinator = coordinator();
        let store = coordinator.store();
        store.set(key("comments", "a1"), 2);
        store.set(key("article", "a1"), 10);

        let result = coordinator
            .run(
                Mutation::new("create-comment", key("comments", "a1"), fails())
                    .optimistic(0, |count| count + 1)
                    .also_update(key("article", "a1"), |count| count + 1)
                    .also_update(key("article", "missing"), |count| count + 1),
            )
            .await;

        assert_eq!(result, Err("offline".to_string()));
        assert_eq!(store.value(&key("comments", "a1")), Some(2));
        assert_eq!(store.value(&key("article", "a1")), Some(10));
        assert!(store.get(&key("article", "a1")).expect("entry").is_stale());
        assert!(
            store
                .get(&key("article", "missing"))
                .expect("placeholder")
                .value
                .is_none()
        );
    }

    #[tokio::test]
    async fn mutation_without_optimistic_write_only_invalidates() {
        let coordinator = coordinator();
        let store = coordinator.store();
        let before = store.set(key("comment", "c1"), 4);

        coordinator
            .run(
                Mutation::new("update-comment", key("comment", "c1"), async {
                    Ok::<_, String>(())
                })
                .invalidates([key("comments", "a1")]),
            )
            .await
            .expect("operation succeeded");

        let entry = store.get(&key("comment", "c1")).expect("entry");
        assert_eq!(entry.value, Some(4));
        assert_eq!(entry.version, before.version);
        assert!(entry.is_stale());
        assert!(store.get(&key("comments", "a1")).expect("entry").is_stale());
    }

    #[tokio::test]
    async fn invalidation_refreshes_each_loaded_key_once() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        coordinator
            .inner
            .fetcher
            .read(CacheKey::root("articles").with(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(5) }
            })
            .await
            .expect("initial load");

        let report = coordinator.invalidate(&[
            CacheKey::root("articles"),
            CacheKey::root("articles").with(1),
            key("like", "a1"),
        ]);
        assert_eq!(coordinator.flush_refreshes().await, 1);

        assert_eq!(
            report.stale,
            vec![
                CacheKey::root("articles"),
                CacheKey::root("articles").with(1),
                key("like", "a1"),
            ]
        );
        assert_eq!(report.refreshing, vec![CacheKey::root("articles").with(1)]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_failure_publishes_notice_and_keeps_value() {
        let coordinator = coordinator();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        coordinator
            .inner
            .fetcher
            .read(key("article", "a1"), move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Ok(8)
                    } else {
                        Err("server down".to_string())
                    }
                }
            })
            .await
            .expect("initial load");

        let report = coordinator.invalidate(&[key("article", "a1")]);
        coordinator.flush_refreshes().await;

        assert_eq!(report.refreshing, vec![key("article", "a1")]);
        let entry = coordinator
            .store()
            .get(&key("article", "a1"))
            .expect("entry");
        assert_eq!(entry.value, Some(8));
        assert_eq!(entry.status, EntryStatus::Idle);

        let notices = coordinator.inner.notices.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert!(notices[0].message.contains("server down"));
    }

    #[test]
    fn settlement_keys_are_deduplicated() {
        let mutation: Mutation<u32, (), String> =
            Mutation::new("delete-comment", key("comments", "a1"), fails())
                .also_update(key("article", "a1"), |count: &u32| count.saturating_sub(1))
                .invalidates([
                    key("comments", "a1"),
                    key("comment", "c1"),
                    key("article", "a1"),
                ]);

        assert_eq!(
            mutation.settlement_keys(),
            vec![
                key("comments", "a1"),
                key("article", "a1"),
                key("comment", "c1"),
            ]
        );
        assert!(format!("{mutation:?}").contains("delete-comment"));
    }
}
