//! Cache strategies applied to a client cache after it becomes ready.

use tokio::task::JoinHandle;

use super::store::ClientCache;

/// Default bound on the persisted log.
pub const DEFAULT_MAX_RESOURCES: usize = 500;

/// A policy run against a cache once it has rehydrated.
pub trait CacheStrategy {
  fn apply(&self, cache: &ClientCache) -> JoinHandle<()>;
}

/// Keep the log under a fixed number of entries.
///
/// Runs a single pass at startup; it bounds the growth of the persisted
/// history rather than acting as an LRU.
#[derive(Debug, Clone, Copy)]
pub struct ResourceCountStrategy {
  max: usize,
}

impl ResourceCountStrategy {
  pub fn new(max: usize) -> Self {
    Self { max }
  }
}

impl Default for ResourceCountStrategy {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_RESOURCES)
  }
}

impl CacheStrategy for ResourceCountStrategy {
  fn apply(&self, cache: &ClientCache) -> JoinHandle<()> {
    let cache = cache.clone();
    let max = self.max;

    tokio::spawn(async move {
      cache.ready().await;
      // Off the startup path: let pending work run first
      tokio::task::yield_now().await;
      cache.evict_oldest(max);
    })
  }
}
