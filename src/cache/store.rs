//! Client cache: in-memory index over an ordered, persisted resource log.

use chrono::{DateTime, Utc};
use color_eyre::eyre::Report;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::storage::PersistedStore;
use crate::executor::Loading;
use crate::resource::{Flag, Partition, Resource};
use crate::transport::HttpResponse;

/// Storage key used by [`super::create_cache`].
pub const DEFAULT_STORAGE_KEY: &str = "client-cache";

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Process-local handles attached to the resource that originated a request.
/// Never serialized.
#[derive(Clone, Default)]
pub struct Attachments {
  pub completion: Option<Loading>,
  pub response: Option<Arc<HttpResponse>>,
  pub error: Option<Arc<Report>>,
}

struct Attached {
  resource: Weak<Resource>,
  attachments: Attachments,
}

impl Attached {
  fn is_for(&self, resource: &Arc<Resource>) -> bool {
    std::ptr::eq(self.resource.as_ptr(), Arc::as_ptr(resource))
  }
}

struct CacheState {
  /// Append-only history, oldest first
  entries: Vec<Arc<Resource>>,
  /// Latest resource per cache key
  index: HashMap<String, Arc<Resource>>,
  attached: HashMap<String, Attached>,
  renew_time: DateTime<Utc>,
}

#[derive(Default)]
struct Listeners {
  next_id: u64,
  callbacks: BTreeMap<u64, Listener>,
}

struct Inner {
  storage_key: String,
  store: Arc<dyn PersistedStore>,
  state: Mutex<CacheState>,
  listeners: Arc<Mutex<Listeners>>,
  ready: watch::Sender<bool>,
  persist_generation: AtomicU64,
  persist_lock: tokio::sync::Mutex<()>,
}

/// Shared resource cache of one client.
///
/// Reads are synchronous so they can be made from render paths. Every
/// mutation is a single critical section; subscribers are told about it
/// afterwards with a payload-free signal and re-read what they need.
#[derive(Clone)]
pub struct ClientCache {
  inner: Arc<Inner>,
}

impl ClientCache {
  /// Create a cache over `store` and start rehydrating it in the background.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(storage_key: impl Into<String>, store: Arc<dyn PersistedStore>) -> Self {
    let (ready, _) = watch::channel(false);

    let cache = Self {
      inner: Arc::new(Inner {
        storage_key: storage_key.into(),
        store,
        state: Mutex::new(CacheState {
          entries: Vec::new(),
          index: HashMap::new(),
          attached: HashMap::new(),
          renew_time: Utc::now(),
        }),
        listeners: Arc::new(Mutex::new(Listeners::default())),
        ready,
        persist_generation: AtomicU64::new(0),
        persist_lock: tokio::sync::Mutex::new(()),
      }),
    };

    let rehydrating = cache.clone();
    tokio::spawn(async move { rehydrating.rehydrate().await });

    cache
  }

  fn state(&self) -> MutexGuard<'_, CacheState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_ready(&self) -> bool {
    *self.inner.ready.borrow()
  }

  /// Wait until rehydration has finished.
  pub async fn ready(&self) {
    let mut ready = self.inner.ready.subscribe();
    // The sender lives in `inner`, so this only ends once ready is set
    let _ = ready.wait_for(|ready| *ready).await;
  }

  pub fn storage_key(&self) -> &str {
    &self.inner.storage_key
  }

  pub fn get(&self, key: &str) -> Option<Arc<Resource>> {
    self.state().index.get(key).cloned()
  }

  pub fn set(&self, key: &str, resource: Arc<Resource>) {
    self.insert(key, resource, None);
  }

  /// Like [`set`](Self::set), attaching process-local handles to `resource`.
  pub fn set_with(&self, key: &str, resource: Arc<Resource>, attachments: Attachments) {
    self.insert(key, resource, Some(attachments));
  }

  fn insert(&self, key: &str, resource: Arc<Resource>, attachments: Option<Attachments>) {
    if !self.is_ready() {
      warn!(
        cache_key = key,
        "Setting the cache before it is ready can lead to unexpected results"
      );
    }

    {
      let mut state = self.state();
      match attachments {
        Some(attachments) => {
          state.attached.insert(
            key.to_string(),
            Attached {
              resource: Arc::downgrade(&resource),
              attachments,
            },
          );
        }
        None => {
          state.attached.remove(key);
        }
      }
      state.index.insert(key.to_string(), Arc::clone(&resource));
      state.entries.push(resource);
    }

    self.persist_in_background();
    self.notify();
  }

  /// Register a listener called after every change. Dropping the returned
  /// subscription unsubscribes.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn() + Send + Sync + 'static,
  {
    let mut listeners = self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    listeners.next_id += 1;
    let id = listeners.next_id;
    listeners.callbacks.insert(id, Arc::new(listener));

    Subscription {
      id,
      listeners: Arc::downgrade(&self.inner.listeners),
    }
  }

  fn notify(&self) {
    // Call outside the lock so listeners can read the cache or unsubscribe
    let callbacks: Vec<Listener> = self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .callbacks
      .values()
      .cloned()
      .collect();

    for callback in callbacks {
      callback();
    }
  }

  /// Everything cached before now should be treated as stale on next read.
  pub fn renew(&self) {
    self.state().renew_time = Utc::now();
    self.notify();
  }

  pub fn renew_time(&self) -> DateTime<Utc> {
    self.state().renew_time
  }

  /// Drop every entry and persist the empty log.
  pub fn purge(&self) -> JoinHandle<()> {
    {
      let mut state = self.state();
      state.entries.clear();
      state.index.clear();
      state.attached.clear();
    }
    debug!(storage_key = %self.inner.storage_key, "Cache purged");

    self.notify();
    self.persist()
  }

  /// Flag every cached resource of the given logical keys as needing a
  /// refetch. Returns how many resources were flagged.
  pub fn mark_needs_refetch(&self, logical_keys: &[&str]) -> usize {
    let flagged = {
      let mut state = self.state();
      let targets: Vec<Arc<Resource>> = state
        .index
        .values()
        .filter(|r| logical_keys.contains(&r.method_options.key.as_str()))
        .cloned()
        .collect();

      for target in &targets {
        let updated = Arc::new(target.with_flag(Flag::NeedsRefetch));
        if let Some(attached) = state.attached.get_mut(&target.cache_key) {
          if attached.is_for(target) {
            attached.resource = Arc::downgrade(&updated);
          }
        }
        state
          .index
          .insert(target.cache_key.clone(), Arc::clone(&updated));
        state.entries.push(updated);
      }
      targets.len()
    };

    if flagged > 0 {
      self.persist_in_background();
      self.notify();
    }
    flagged
  }

  /// Trim the log to at most `max` entries, oldest first.
  ///
  /// An index entry is only dropped when the resource it points at is no
  /// longer in the log; a key rewritten later keeps its latest value.
  /// Returns the number of log entries removed.
  pub fn evict_oldest(&self, max: usize) -> usize {
    let removed = {
      let mut state = self.state();
      if state.entries.len() <= max {
        return 0;
      }

      let excess = state.entries.len() - max;
      let drained: Vec<Arc<Resource>> = state.entries.drain(..excess).collect();
      let live: HashSet<*const Resource> = state.entries.iter().map(Arc::as_ptr).collect();

      for resource in &drained {
        let still_logged = state
          .index
          .get(&resource.cache_key)
          .is_some_and(|latest| live.contains(&Arc::as_ptr(latest)));
        if !still_logged {
          state.index.remove(&resource.cache_key);
          state.attached.remove(&resource.cache_key);
        }
      }
      drained.len()
    };

    debug!(removed, max, "Evicted oldest cache entries");
    self.persist_in_background();
    removed
  }

  /// Number of entries in the log (not distinct keys).
  pub fn len(&self) -> usize {
    self.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state().entries.is_empty()
  }

  /// Snapshot of the log, oldest first.
  pub fn entries(&self) -> Vec<Arc<Resource>> {
    self.state().entries.clone()
  }

  /// Snapshot of the latest resource per key, ordered by key.
  pub fn resources(&self) -> Vec<Arc<Resource>> {
    let mut resources: Vec<Arc<Resource>> = self.state().index.values().cloned().collect();
    resources.sort_by(|a, b| a.cache_key.cmp(&b.cache_key));
    resources
  }

  fn attachment<T>(
    &self,
    resource: &Arc<Resource>,
    pick: impl FnOnce(&Attachments) -> Option<T>,
  ) -> Option<T> {
    let state = self.state();
    let attached = state.attached.get(&resource.cache_key)?;
    if attached.is_for(resource) {
      pick(&attached.attachments)
    } else {
      None
    }
  }

  /// Completion handle of an in-flight resource started by this process.
  pub fn completion(&self, resource: &Arc<Resource>) -> Option<Loading> {
    self.attachment(resource, |a| a.completion.clone())
  }

  pub fn raw_response(&self, resource: &Arc<Resource>) -> Option<Arc<HttpResponse>> {
    self.attachment(resource, |a| a.response.clone())
  }

  pub fn raw_error(&self, resource: &Arc<Resource>) -> Option<Arc<Report>> {
    self.attachment(resource, |a| a.error.clone())
  }

  fn persist_in_background(&self) {
    // Rehydration persists once it has merged the stored log
    if self.is_ready() {
      drop(self.persist());
    }
  }

  /// Write the disk-partition subset of the log to the store.
  ///
  /// When several persists overlap, the snapshot taken by the last call is
  /// the one left in the store. Failures are logged.
  pub fn persist(&self) -> JoinHandle<()> {
    // Generation and snapshot come from one critical section, so a higher
    // generation never carries an older log
    let (generation, snapshot) = {
      let state = self.state();
      let generation = self.inner.persist_generation.fetch_add(1, Ordering::SeqCst) + 1;
      let snapshot: Vec<Arc<Resource>> = state
        .entries
        .iter()
        .filter(|r| Partition::of_key(&r.cache_key) == Some(Partition::Disk))
        .cloned()
        .collect();
      (generation, snapshot)
    };

    let cache = self.clone();
    tokio::spawn(async move { cache.write_snapshot(generation, snapshot).await })
  }

  async fn write_snapshot(&self, generation: u64, snapshot: Vec<Arc<Resource>>) {
    let _guard = self.inner.persist_lock.lock().await;
    if self.inner.persist_generation.load(Ordering::SeqCst) != generation {
      trace!(generation, "Skipping superseded cache snapshot");
      return;
    }

    let records: Vec<&Resource> = snapshot.iter().map(Arc::as_ref).collect();
    let blob = match serde_json::to_string(&records) {
      Ok(blob) => blob,
      Err(e) => {
        error!(error = %e, "Failed to serialize cache for persistence");
        return;
      }
    };

    match self.inner.store.set(&self.inner.storage_key, blob).await {
      Ok(()) => trace!(entries = records.len(), "Persisted cache"),
      Err(e) => warn!(
        storage_key = %self.inner.storage_key,
        error = %e,
        "Failed to persist cache"
      ),
    }
  }

  async fn rehydrate(&self) {
    let storage_key = &self.inner.storage_key;
    let stored: Vec<Resource> = match self.inner.store.get(storage_key).await {
      Ok(Some(blob)) => match serde_json::from_str(&blob) {
        Ok(stored) => stored,
        Err(e) => {
          error!(
            storage_key = %storage_key,
            error = %e,
            "Persisted cache is unreadable, starting empty; earlier cached data is lost"
          );
          Vec::new()
        }
      },
      Ok(None) => Vec::new(),
      Err(e) => {
        error!(
          storage_key = %storage_key,
          error = %e,
          "Failed to load persisted cache, starting empty"
        );
        Vec::new()
      }
    };

    let restored = stored.len();
    let written_early = {
      let mut state = self.state();
      // Anything set before readiness is newer than the stored log
      let early = std::mem::take(&mut state.entries);
      let written_early = !early.is_empty();

      let mut entries: Vec<Arc<Resource>> = stored.into_iter().map(Arc::new).collect();
      entries.extend(early);

      state.index = HashMap::with_capacity(entries.len());
      for resource in &entries {
        state
          .index
          .insert(resource.cache_key.clone(), Arc::clone(resource));
      }
      state.entries = entries;
      written_early
    };

    self.inner.ready.send_replace(true);
    debug!(storage_key = %storage_key, restored, "Cache ready");

    if written_early {
      drop(self.persist());
    }
    self.notify();
  }
}

/// Listener registration returned by [`ClientCache::subscribe`].
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
  id: u64,
  listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
  /// Stop receiving notifications. Safe to call more than once.
  pub fn unsubscribe(&self) {
    if let Some(listeners) = self.listeners.upgrade() {
      listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .callbacks
        .remove(&self.id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}
