//! TTL policy, dirty tracking and hit/miss accounting on top of a [`Store`].

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, EntrySource};
use super::query::Query;
use super::storage::{Store, StoreResult};
use super::traits::Cacheable;
use crate::clock::{Clock, SharedClock};

/// Default lifetime of a cached entry, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

/// Options for [`CacheManager::set`].
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
  /// `None` keeps the entry until it is invalidated
  pub ttl: Option<Duration>,
  pub source: EntrySource,
}

impl Default for SetOptions {
  fn default() -> Self {
    Self {
      ttl: Some(Duration::seconds(DEFAULT_TTL_SECS)),
      source: EntrySource::Server,
    }
  }
}

impl SetOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn without_expiry(mut self) -> Self {
    self.ttl = None;
    self
  }

  pub fn local(mut self) -> Self {
    self.source = EntrySource::Local;
    self
  }
}

/// Options for [`CacheManager::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
  /// Skip the cache and count the lookup as a miss
  pub force_refresh: bool,
}

/// Hit/miss counters since start or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// Cache manager wrapping the persistent store.
///
/// Reads never fail: storage errors and undecodable entries are logged and
/// reported as misses. Writes propagate errors so a failed local write is
/// never silently lost.
pub struct CacheManager {
  store: Arc<dyn Store>,
  clock: SharedClock,
  default_ttl: Option<Duration>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl CacheManager {
  pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
    Self {
      store,
      clock,
      default_ttl: Some(Duration::seconds(DEFAULT_TTL_SECS)),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  /// Set the TTL used by [`SetOptions`] built from [`CacheManager::set_options`].
  pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Set options carrying this manager's configured default TTL.
  pub fn set_options(&self) -> SetOptions {
    SetOptions {
      ttl: self.default_ttl,
      ..SetOptions::default()
    }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  /// Cached payload for `id`, or `None` on miss.
  pub fn get<T: DeserializeOwned>(&self, store: &str, id: &str, opts: GetOptions) -> Option<T> {
    self.get_entry(store, id, opts).map(|entry| entry.data)
  }

  /// Like [`CacheManager::get`] but keeps the entry metadata.
  pub fn get_entry<T: DeserializeOwned>(
    &self,
    store: &str,
    id: &str,
    opts: GetOptions,
  ) -> Option<CacheEntry<T>> {
    if opts.force_refresh {
      self.record_miss();
      return None;
    }

    let entry = match self.store.get(store, id) {
      Ok(Some(entry)) => entry,
      Ok(None) => {
        self.record_miss();
        return None;
      }
      Err(e) => {
        warn!(store, id, error = %e, "cache read failed");
        self.record_miss();
        return None;
      }
    };

    match self.decode(store, entry) {
      Some(entry) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
      }
      None => {
        self.record_miss();
        None
      }
    }
  }

  /// Every live payload in a partition.
  pub fn get_all<T: DeserializeOwned>(&self, store: &str) -> Vec<T> {
    self
      .get_all_entries(store)
      .into_iter()
      .map(|entry| entry.data)
      .collect()
  }

  pub fn get_all_entries<T: DeserializeOwned>(&self, store: &str) -> Vec<CacheEntry<T>> {
    match self.store.get_all(store) {
      Ok(entries) => entries
        .into_iter()
        .filter_map(|entry| self.decode(store, entry))
        .collect(),
      Err(e) => {
        warn!(store, error = %e, "cache read failed");
        Vec::new()
      }
    }
  }

  /// Wrap `data` in a fresh, clean, version 1 entry and persist it.
  pub fn set<T: Serialize + ?Sized>(
    &self,
    store: &str,
    id: &str,
    data: &T,
    opts: SetOptions,
  ) -> StoreResult<()> {
    let now = self.clock.now();
    let data = serde_json::to_value(data)?;
    let entry = CacheEntry::new(id, data, now, opts.ttl.map(|ttl| now + ttl), opts.source);
    self.store.put(store, &entry)
  }

  /// Persist an optimistic local write: LOCAL source, flagged dirty, one
  /// version above any live entry it replaces.
  pub fn set_local<T: Serialize + ?Sized>(
    &self,
    store: &str,
    id: &str,
    data: &T,
    ttl: Option<Duration>,
  ) -> StoreResult<()> {
    let now = self.clock.now();
    let data = serde_json::to_value(data)?;
    let previous = self.store.get(store, id)?.map_or(0, |entry| entry.version);
    let mut entry = CacheEntry::new(id, data, now, ttl.map(|ttl| now + ttl), EntrySource::Local);
    entry.dirty = true;
    entry.version = previous + 1;
    self.store.put(store, &entry)
  }

  /// Delete one entry, or the whole partition when `id` is `None`.
  pub fn invalidate(&self, store: &str, id: Option<&str>) -> StoreResult<()> {
    match id {
      Some(id) => self.store.delete(store, id),
      None => self.store.clear(store),
    }
  }

  /// Flag an entry as carrying an unconfirmed local change.
  ///
  /// Returns `false` when there is no live entry to mark.
  pub fn mark_dirty(&self, store: &str, id: &str) -> StoreResult<bool> {
    let Some(mut entry) = self.store.get(store, id)? else {
      return Ok(false);
    };
    entry.dirty = true;
    entry.version += 1;
    entry.timestamp = self.clock.now();
    self.store.put(store, &entry)?;
    Ok(true)
  }

  /// Entries with unconfirmed local changes.
  pub fn get_dirty_data(&self, store: &str) -> Vec<CacheEntry<Value>> {
    match self.store.query(store, &Query::new().filter(|e| e.dirty)) {
      Ok(result) => result.items,
      Err(e) => {
        warn!(store, error = %e, "failed to read dirty entries");
        Vec::new()
      }
    }
  }

  /// Remove every expired entry. Returns how many were removed.
  pub fn cleanup(&self) -> StoreResult<usize> {
    let removed = self.store.purge_expired(None)?;
    if removed > 0 {
      info!(removed, "cache cleanup removed expired entries");
    } else {
      debug!("cache cleanup found nothing to remove");
    }
    Ok(removed)
  }

  /// Run [`CacheManager::cleanup`] every `interval` until the task is aborted.
  pub fn spawn_cleanup(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
    let manager = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // First tick fires immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Err(e) = manager.cleanup() {
          warn!(error = %e, "scheduled cache cleanup failed");
        }
      }
    })
  }

  /// Clear every domain partition. Queue and metadata are left alone.
  pub fn clear_all(&self) -> StoreResult<()> {
    for partition in self.store.partitions() {
      self.store.clear(partition)?;
    }
    info!("cleared all cached data");
    Ok(())
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
    }
  }

  pub fn reset_stats(&self) {
    self.hits.store(0, Ordering::Relaxed);
    self.misses.store(0, Ordering::Relaxed);
  }

  // --------------------------------------------------------------------------
  // Typed record wrappers
  // --------------------------------------------------------------------------

  pub fn cache_entity<T: Cacheable>(&self, entity: &T) -> StoreResult<()> {
    self.set(T::store_name(), &entity.cache_key(), entity, self.set_options())
  }

  pub fn cache_entities<T: Cacheable>(&self, entities: &[T]) -> StoreResult<()> {
    for entity in entities {
      self.cache_entity(entity)?;
    }
    Ok(())
  }

  pub fn get_entity<T: Cacheable>(&self, key: &str) -> Option<T> {
    self.get(T::store_name(), key, GetOptions::default())
  }

  pub fn get_entities<T: Cacheable>(&self) -> Vec<T> {
    self.get_all(T::store_name())
  }

  fn record_miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  /// Decode a stored payload; undecodable entries are deleted.
  fn decode<T: DeserializeOwned>(&self, store: &str, entry: CacheEntry) -> Option<CacheEntry<T>> {
    match serde_json::from_value::<T>(entry.data.clone()) {
      Ok(data) => Some(entry.map(|_| data)),
      Err(e) => {
        warn!(store, id = %entry.id, error = %e, "discarding undecodable cache entry");
        if let Err(e) = self.store.delete(store, &entry.id) {
          debug!(store, id = %entry.id, error = %e, "failed to delete undecodable entry");
        }
        None
      }
    }
  }
}
