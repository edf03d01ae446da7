//! Resource cache with persistence and eviction.
//!
//! This module provides:
//! - [`ClientCache`]: synchronous reads, an append-only log and a latest-per-key index
//! - Persistence of the disk partition through a [`PersistedStore`]
//! - Rehydration on startup and a one-shot ready signal
//! - [`ResourceCountStrategy`]: bounds the persisted log at startup
//! - [`derive_key`]: maps a logical request to its cache slot

mod key;
mod storage;
mod store;
mod strategy;

use std::sync::Arc;

pub use key::derive_key;
pub use storage::{MemoryStore, PersistedStore, SqliteStore};
pub use store::{Attachments, ClientCache, Subscription, DEFAULT_STORAGE_KEY};
pub use strategy::{CacheStrategy, ResourceCountStrategy, DEFAULT_MAX_RESOURCES};

/// Create a cache under the default storage key, bounded to `max_resources`
/// log entries once it has rehydrated.
pub fn create_cache(store: Arc<dyn PersistedStore>, max_resources: usize) -> ClientCache {
  let cache = ClientCache::new(DEFAULT_STORAGE_KEY, store);
  // Runs on its own once the cache is ready
  drop(ResourceCountStrategy::new(max_resources).apply(&cache));
  cache
}
