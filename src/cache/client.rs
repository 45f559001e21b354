//! Query client façade.
//!
//! Bundles the store, fetcher, coordinator, invalidation graph, and notice
//! board behind one cloneable handle. Feature code only needs this type.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::fetcher::Fetcher;
use super::invalidation::{InvalidationGraph, MutationArgs, TemplateError};
use super::keys::CacheKey;
use super::mutation::{Coordinator, InvalidationReport, Mutation};
use super::notice::NoticeBoard;
use super::store::QueryStore;
use super::subscription::Subscription;

pub struct QueryClient<V, E> {
    fetcher: Fetcher<V, E>,
    coordinator: Coordinator<V, E>,
    graph: Arc<InvalidationGraph>,
    notices: NoticeBoard,
}

impl<V, E> Clone for QueryClient<V, E> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            coordinator: self.coordinator.clone(),
            graph: Arc::clone(&self.graph),
            notices: self.notices.clone(),
        }
    }
}

impl<V, E> QueryClient<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    pub fn new(config: &CacheConfig, graph: InvalidationGraph) -> Self {
        let fetcher = Fetcher::new(QueryStore::new(config), config);
        let notices = NoticeBoard::new(config);
        Self {
            coordinator: Coordinator::new(fetcher.clone(), notices.clone()),
            fetcher,
            graph: Arc::new(graph),
            notices,
        }
    }

    pub fn store(&self) -> &QueryStore<V> {
        self.fetcher.store()
    }

    pub fn fetcher(&self) -> &Fetcher<V, E> {
        &self.fetcher
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    pub fn graph(&self) -> &InvalidationGraph {
        &self.graph
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.store().get(key)
    }

    pub fn value(&self, key: &CacheKey) -> Option<V> {
        self.store().value(key)
    }

    pub fn set(&self, key: CacheKey, value: V) -> CacheEntry<V> {
        self.store().set(key, value)
    }

    pub fn subscribe<F>(&self, key: CacheKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEntry<V>) + Send + Sync + 'static,
    {
        self.store().subscribe(key, listener)
    }

    /// See [`Fetcher::read`].
    pub async fn read<F, Fut>(&self, key: CacheKey, loader: F) -> Result<V, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.fetcher.read(key, loader).await
    }

    /// Start a mutation of `category` whose dependents come from the
    /// invalidation graph, resolved against `args`.
    pub fn mutation<R, OE, Fut>(
        &self,
        category: &str,
        target: CacheKey,
        args: &MutationArgs,
        operation: Fut,
    ) -> Result<Mutation<V, R, OE>, TemplateError>
    where
        Fut: Future<Output = Result<R, OE>> + Send + 'static,
    {
        let dependents = self.graph.resolve(category, args)?;
        Ok(Mutation::new(category, target, operation).invalidates(dependents))
    }

    /// See [`Coordinator::run`].
    pub async fn run<R, OE>(&self, mutation: Mutation<V, R, OE>) -> Result<R, OE>
    where
        R: Send + 'static,
        OE: Send + 'static,
    {
        self.coordinator.run(mutation).await
    }

    pub fn invalidate(&self, keys: &[CacheKey]) -> InvalidationReport {
        self.coordinator.invalidate(keys)
    }

    /// Drop every cached entry. Subscriptions survive and hear about the keys
    /// again once they are next written. Returns how many entries went.
    pub fn clear(&self) -> usize {
        self.store().clear()
    }

    /// Wait for background refreshes scheduled so far.
    pub async fn flush_refreshes(&self) -> usize {
        self.coordinator.flush_refreshes().await
    }
}
