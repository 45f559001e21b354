//! Optimistic-mutation cache coordinator.
//!
//! [`cache`] holds the generic machinery: a keyed store with versioned
//! entries, deduplicated fetches, optimistic mutations with snapshot
//! rollback, and a declarative invalidation graph. [`forum`] binds it to a
//! community forum's likes, comments, and account features.

pub mod cache;
pub mod config;
pub mod error;
pub mod forum;
pub mod telemetry;
