//! Cache configuration.
//!
//! Controls capacity, freshness, and the notice backlog via the `[cache]`
//! section of `optimist.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_ENTRIES: usize = 500;
const DEFAULT_STALE_AFTER_MS: u64 = 0;
const DEFAULT_NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction kicks in. Zero disables
    /// eviction.
    pub max_entries: usize,
    /// Age (ms) after which an idle value counts as stale. Zero keeps values
    /// fresh until they are invalidated.
    pub stale_after_ms: u64,
    /// Maximum number of undrained notices.
    pub notice_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Capacity bound, or `None` when eviction is disabled.
    pub fn capacity(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_entries)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_ms > 0).then(|| Duration::from_millis(self.stale_after_ms))
    }

    /// Notice capacity clamped to at least one.
    pub fn notice_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.notice_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 500);
        assert_eq!(config.stale_after_ms, 0);
        assert_eq!(config.notice_capacity, 32);
    }

    #[test]
    fn zero_disables_capacity_and_aging() {
        let config = CacheConfig {
            max_entries: 0,
            stale_after_ms: 0,
            ..Default::default()
        };
        assert!(config.capacity().is_none());
        assert!(config.stale_after().is_none());
    }

    #[test]
    fn stale_after_converts_to_duration() {
        let config = CacheConfig {
            stale_after_ms: 1500,
            ..Default::default()
        };
        assert_eq!(config.stale_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn notice_capacity_clamps_to_min() {
        let config = CacheConfig {
            notice_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.notice_capacity_non_zero().get(), 1);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"max_entries": 10}"#).expect("valid cache section");
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.notice_capacity, 32);
    }
}
