//! Sync error types.

use crate::cache::StoreError;
use crate::connectivity::ConnectionQuality;

/// Reasons a queue run refuses to start or a queue write fails.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  /// Another run is in flight in this process.
  #[error("a sync run is already in progress")]
  AlreadyProcessing,

  /// Connectivity is below GOOD.
  #[error("connection quality {0:?} is too low to sync")]
  NotConnected(ConnectionQuality),

  #[error("sync is paused")]
  Paused,

  /// Another process holds the sync lease on this store.
  #[error("sync lease is held by another client")]
  LeaseHeld,

  #[error("queue storage error: {0}")]
  Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;
