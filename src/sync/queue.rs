//! Durable queue of pending mutations.
//!
//! Operations live in the `sync_queue` partition of the store, one entry per
//! operation and without expiry, so they survive restarts. Terminally failed
//! operations are moved to `sync_failed` where an operator can inspect,
//! retry or discard them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::operation::QueuedOperation;
use crate::cache::{partitions, CacheEntry, EntrySource, Store, StoreResult};
use crate::state::SyncWriter;

pub struct OperationQueue {
  store: Arc<dyn Store>,
  writer: Option<SyncWriter>,
}

impl OperationQueue {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self {
      store,
      writer: None,
    }
  }

  /// Keep the published pending count in step when corrupt entries are dropped.
  pub fn with_writer(mut self, writer: SyncWriter) -> Self {
    self.writer = Some(writer);
    self
  }

  /// Insert or replace a pending operation.
  pub fn save(&self, op: &QueuedOperation) -> StoreResult<()> {
    self.store.put(partitions::SYNC_QUEUE, &to_entry(op)?)
  }

  pub fn get(&self, id: &str) -> StoreResult<Option<QueuedOperation>> {
    Ok(
      self
        .store
        .get(partitions::SYNC_QUEUE, id)?
        .and_then(|entry| self.decode(partitions::SYNC_QUEUE, entry)),
    )
  }

  pub fn remove(&self, id: &str) -> StoreResult<()> {
    self.store.delete(partitions::SYNC_QUEUE, id)
  }

  /// Pending operations in dequeue order: priority desc, then oldest first.
  pub fn pending(&self) -> StoreResult<Vec<QueuedOperation>> {
    let mut ops = self.load(partitions::SYNC_QUEUE)?;
    ops.sort_by(|a, b| {
      b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
    });
    Ok(ops)
  }

  /// Pending operations whose backoff has elapsed, in dequeue order.
  pub fn due(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueuedOperation>> {
    Ok(
      self
        .pending()?
        .into_iter()
        .filter(|op| op.is_due(now))
        .collect(),
    )
  }

  pub fn len(&self) -> StoreResult<usize> {
    self.store.count(partitions::SYNC_QUEUE)
  }

  pub fn is_empty(&self) -> StoreResult<bool> {
    Ok(self.len()? == 0)
  }

  /// Drop every pending operation. Returns how many were removed.
  pub fn clear(&self) -> StoreResult<usize> {
    let removed = self.len()?;
    self.store.clear(partitions::SYNC_QUEUE)?;
    Ok(removed)
  }

  // --------------------------------------------------------------------------
  // Failed bucket
  // --------------------------------------------------------------------------

  /// Move an operation from the queue into the failed bucket.
  pub fn move_to_failed(&self, op: &QueuedOperation) -> StoreResult<()> {
    self.store.put(partitions::SYNC_FAILED, &to_entry(op)?)?;
    self.remove(&op.id)
  }

  /// Failed operations, oldest first.
  pub fn failed(&self) -> StoreResult<Vec<QueuedOperation>> {
    let mut ops = self.load(partitions::SYNC_FAILED)?;
    ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(ops)
  }

  /// Remove a failed operation and hand it back, if present.
  pub fn take_failed(&self, id: &str) -> StoreResult<Option<QueuedOperation>> {
    let op = self
      .store
      .get(partitions::SYNC_FAILED, id)?
      .and_then(|entry| self.decode(partitions::SYNC_FAILED, entry));
    if op.is_some() {
      self.store.delete(partitions::SYNC_FAILED, id)?;
    }
    Ok(op)
  }

  pub fn clear_failed(&self) -> StoreResult<usize> {
    let removed = self.store.count(partitions::SYNC_FAILED)?;
    self.store.clear(partitions::SYNC_FAILED)?;
    Ok(removed)
  }

  fn load(&self, partition: &str) -> StoreResult<Vec<QueuedOperation>> {
    Ok(
      self
        .store
        .get_all(partition)?
        .into_iter()
        .filter_map(|entry| self.decode(partition, entry))
        .collect(),
    )
  }

  /// Entries that no longer decode are removed rather than retried forever.
  fn decode(&self, partition: &str, entry: CacheEntry) -> Option<QueuedOperation> {
    match serde_json::from_value::<QueuedOperation>(entry.data) {
      Ok(op) => Some(op),
      Err(e) => {
        warn!(partition, id = %entry.id, error = %e, "discarding corrupt queued operation");
        match self.store.delete(partition, &entry.id) {
          Ok(()) if partition == partitions::SYNC_QUEUE => {
            if let Some(writer) = &self.writer {
              writer.decrement_pending();
            }
          }
          Ok(()) => {}
          Err(e) => {
            debug!(partition, id = %entry.id, error = %e, "failed to delete corrupt operation")
          }
        }
        None
      }
    }
  }
}

fn to_entry(op: &QueuedOperation) -> StoreResult<CacheEntry<Value>> {
  let data = serde_json::to_value(op)?;
  let mut entry = CacheEntry::new(op.id.clone(), data, op.created_at, None, EntrySource::Local);
  entry.dirty = true;
  Ok(entry)
}
