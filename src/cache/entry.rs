//! Cache entry and freshness metadata.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::keys::CacheKey;

/// Write counter value. Drawn from one store-wide clock, so a key's version
/// only ever grows, even across eviction and re-creation.
pub type Version = u64;

/// Freshness of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Value is trusted until invalidated or aged out.
    Idle,
    /// A loader is in flight for this key.
    Fetching,
    /// Value must be refetched before the next trusted read.
    Stale,
}

/// Last known value for a key plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    /// `None` for placeholders created by invalidation or a first fetch.
    pub value: Option<V>,
    pub status: EntryStatus,
    /// Zero until the first value write.
    pub version: Version,
    /// When the current value was written.
    pub updated_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    pub(crate) fn vacant(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            status: EntryStatus::Idle,
            version: 0,
            updated_at: None,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.status == EntryStatus::Stale
    }

    /// Whether a read may serve this entry without calling a loader.
    pub fn is_fresh(&self, stale_after: Option<Duration>) -> bool {
        if self.value.is_none() || self.status != EntryStatus::Idle {
            return false;
        }
        match (stale_after, self.updated_at) {
            (Some(max_age), Some(written)) => written.elapsed() < max_age,
            _ => true,
        }
    }
}
