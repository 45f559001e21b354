//! Optimistic-mutation cache
//!
//! Keeps server state on the client side and lets feature code change it
//! speculatively:
//!
//! - **Store**: structural keys to versioned entries, with per-key listeners
//! - **Fetcher**: deduplicated reads that fill the store
//! - **Coordinator**: snapshot, optimistic write, rollback-if-current, and
//!   invalidation around each server operation
//! - **Invalidation graph**: which keys each mutation category makes stale
//!
//! ## Configuration
//!
//! Capacity and freshness come from `optimist.toml`:
//!
//! ```toml
//! [cache]
//! max_entries = 500
//! stale_after_ms = 0
//! notice_capacity = 32
//! ```

mod client;
mod config;
mod entry;
mod fetcher;
mod invalidation;
mod keys;
pub(crate) mod lock;
mod mutation;
mod notice;
mod snapshot;
mod store;
mod subscription;

pub use client::QueryClient;
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryStatus, Version};
pub use fetcher::{Fetcher, LoadFuture, Loader};
pub use invalidation::{
    InvalidationGraph, KeyTemplate, MutationArgs, TemplateError, TemplateSegment,
};
pub use keys::{CacheKey, KeySegment};
pub use mutation::{Coordinator, InvalidationReport, Mutation};
pub use notice::{Notice, NoticeBoard, NoticeLevel};
pub use snapshot::{RollbackOutcome, Snapshot, SnapshotEntry};
pub use store::{Listener, QueryStore};
pub use subscription::Subscription;
