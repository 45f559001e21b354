//! Pre-mutation cache state kept for rollback.

use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use super::entry::Version;
use super::keys::CacheKey;
use super::store::QueryStore;

/// One captured entry.
#[derive(Debug, Clone)]
pub struct SnapshotEntry<V> {
    pub key: CacheKey,
    /// Value before the mutation; `None` when the key held nothing.
    pub value: Option<V>,
    /// Version before the mutation.
    pub version: Version,
    pub updated_at: Option<Instant>,
    /// Version produced by the owning mutation's optimistic write, if it
    /// wrote this key. Rollback only applies while the entry still carries it.
    pub written: Option<Version>,
}

/// How a rollback attempt for one key ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The captured value was written back.
    Restored,
    /// A newer write landed after the optimistic one; the newer state wins.
    StaleSnapshotDiscarded,
    /// The mutation never wrote this key, so there was nothing to undo.
    Untouched,
}

impl RollbackOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restored => "restored",
            Self::StaleSnapshotDiscarded => "discarded",
            Self::Untouched => "untouched",
        }
    }
}

/// Immutable copy of the entries a pending mutation may need to roll back.
///
/// Owned exclusively by one mutation. Captured keys stay pinned against
/// eviction until the snapshot is dropped. A snapshot dropped without being
/// restored or discarded marks every key it wrote stale, so an abandoned
/// optimistic write is refetched instead of trusted.
pub struct Snapshot<V: Clone> {
    mutation_id: Uuid,
    store: QueryStore<V>,
    entries: Vec<SnapshotEntry<V>>,
    settled: bool,
}

impl<V: Clone> Snapshot<V> {
    /// Capture `target` unconditionally and each of `others` that currently
    /// holds a value.
    pub(crate) fn capture<'a, I>(
        store: &QueryStore<V>,
        mutation_id: Uuid,
        target: &CacheKey,
        others: I,
    ) -> Self
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut snapshot = Self {
            mutation_id,
            store: store.clone(),
            entries: Vec::new(),
            settled: false,
        };

        snapshot.push(target, true);
        for key in others {
            snapshot.push(key, false);
        }
        snapshot
    }

    fn push(&mut self, key: &CacheKey, always: bool) {
        if self.entries.iter().any(|entry| &entry.key == key) {
            return;
        }

        let captured = match self.store.get(key) {
            Some(entry) if always || entry.has_value() => SnapshotEntry {
                key: key.clone(),
                value: entry.value,
                version: entry.version,
                updated_at: entry.updated_at,
                written: None,
            },
            Some(_) => return,
            None if always => SnapshotEntry {
                key: key.clone(),
                value: None,
                version: 0,
                updated_at: None,
                written: None,
            },
            None => return,
        };

        self.store.pin(key);
        self.entries.push(captured);
    }

    pub fn mutation_id(&self) -> Uuid {
        self.mutation_id
    }

    pub fn entries(&self) -> &[SnapshotEntry<V>] {
        &self.entries
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.iter().any(|entry| &entry.key == key)
    }

    /// Note the version the owning mutation's optimistic write produced.
    pub(crate) fn record_write(&mut self, key: &CacheKey, version: Version) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| &entry.key == key) {
            entry.written = Some(version);
        }
    }

    /// Roll every written key back if it is still current. Consumes the
    /// snapshot.
    pub(crate) fn restore(mut self) -> Vec<(CacheKey, RollbackOutcome)> {
        self.settled = true;
        self.entries
            .iter()
            .map(|entry| (entry.key.clone(), self.store.restore(entry)))
            .collect()
    }

    /// Drop the snapshot after a successful mutation.
    pub(crate) fn discard(mut self) {
        self.settled = true;
        debug!(
            mutation_id = %self.mutation_id,
            entries = self.entries.len(),
            "Discarded mutation snapshot"
        );
    }
}

impl<V: Clone> Drop for Snapshot<V> {
    fn drop(&mut self) {
        for entry in &self.entries {
            self.store.unpin(&entry.key);
        }

        if self.settled {
            return;
        }
        for entry in self.entries.iter().filter(|entry| entry.written.is_some()) {
            warn!(
                mutation_id = %self.mutation_id,
                key = %entry.key,
                "Mutation abandoned before settling; marking its write stale"
            );
            self.store.mark_stale(&entry.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(["article", name])
    }

    #[test]
    fn capture_always_includes_target() {
        let store: QueryStore<u32> = QueryStore::new(&CacheConfig::default());
        store.set(key("cached"), 5);
        store.mark_stale(&key("placeholder"));

        let snapshot = Snapshot::capture(
            &store,
            Uuid::new_v4(),
            &key("target"),
            [&key("cached"), &key("placeholder"), &key("unknown")],
        );

        assert!(snapshot.contains(&key("target")));
        assert!(snapshot.contains(&key("cached")));
        assert!(!snapshot.contains(&key("placeholder")));
        assert!(!snapshot.contains(&key("unknown")));
        assert_eq!(snapshot.entries()[1].value, Some(5));
    }

    #[test]
    fn unwritten_entries_are_untouched_on_restore() {
        let store: QueryStore<u32> = QueryStore::new(&CacheConfig::default());
        store.set(key("target"), 1);
        store.set(key("other"), 2);

        let mut snapshot =
            Snapshot::capture(&store, Uuid::new_v4(), &key("target"), [&key("other")]);
        let written = store.set(key("target"), 10);
        snapshot.record_write(&key("target"), written.version);
        store.set(key("other"), 20);

        let outcomes = snapshot.restore();
        assert_eq!(
            outcomes,
            vec![
                (key("target"), RollbackOutcome::Restored),
                (key("other"), RollbackOutcome::Untouched),
            ]
        );
        assert_eq!(store.value(&key("target")), Some(1));
        assert_eq!(store.value(&key("other")), Some(20));
    }

    #[test]
    fn abandoned_snapshot_marks_written_keys_stale() {
        let store: QueryStore<u32> = QueryStore::new(&CacheConfig::default());
        store.set(key("target"), 1);
        store.set(key("other"), 2);

        let mut snapshot =
            Snapshot::capture(&store, Uuid::new_v4(), &key("target"), [&key("other")]);
        let written = store.set(key("target"), 10);
        snapshot.record_write(&key("target"), written.version);
        drop(snapshot);

        let target = store.get(&key("target")).expect("target");
        assert!(target.is_stale());
        assert_eq!(target.value, Some(10));
        assert!(!store.get(&key("other")).expect("other").is_stale());
    }

    #[test]
    fn settled_snapshot_leaves_status_alone() {
        let store: QueryStore<u32> = QueryStore::new(&CacheConfig::default());
        let mut snapshot =
            Snapshot::capture(&store, Uuid::new_v4(), &key("target"), [] as [&CacheKey; 0]);
        let written = store.set(key("target"), 10);
        snapshot.record_write(&key("target"), written.version);

        snapshot.discard();

        assert!(!store.get(&key("target")).expect("target").is_stale());
    }

    #[test]
    fn restoring_absent_prior_value_clears_the_entry() {
        let store: QueryStore<u32> = QueryStore::new(&CacheConfig::default());

        let mut snapshot =
            Snapshot::capture(&store, Uuid::new_v4(), &key("new"), [] as [&CacheKey; 0]);
        let written = store.set(key("new"), 1);
        snapshot.record_write(&key("new"), written.version);

        snapshot.restore();
        let entry = store.get(&key("new")).expect("entry kept");
        assert!(entry.value.is_none());
        assert!(entry.version > written.version);
    }
}
