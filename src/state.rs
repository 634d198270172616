//! Process-wide connection and sync state.
//!
//! The state lives behind a single `watch` channel. Components never get the
//! channel itself: the connectivity monitor receives a [`ConnectivityWriter`]
//! and the sync engine a [`SyncWriter`], each able to touch only its own
//! fields. Readers subscribe through [`SharedState::subscribe`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::connectivity::ConnectionQuality;

/// Lifecycle of the mutation queue as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
  Idle,
  Syncing,
  /// Last run finished with every attempted operation confirmed
  Success,
  /// Last run finished with at least one failed attempt
  Error,
  Paused,
}

impl SyncStatus {
  /// Whether a new queue run may start from this status.
  ///
  /// `Success` and `Error` are resting states after a run.
  pub fn is_idle(self) -> bool {
    matches!(self, Self::Idle | Self::Success | Self::Error)
  }
}

/// Snapshot of everything the UI indicator needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
  pub is_online: bool,
  pub connection_quality: ConnectionQuality,
  pub last_online_at: Option<DateTime<Utc>>,
  pub sync_status: SyncStatus,
  pub pending_operations_count: usize,
}

impl Default for ConnectionState {
  fn default() -> Self {
    Self {
      is_online: false,
      connection_quality: ConnectionQuality::Offline,
      last_online_at: None,
      sync_status: SyncStatus::Idle,
      pending_operations_count: 0,
    }
  }
}

/// Owner of the shared state channel.
#[derive(Clone)]
pub struct SharedState {
  tx: Arc<watch::Sender<ConnectionState>>,
}

impl SharedState {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(ConnectionState::default());
    Self { tx: Arc::new(tx) }
  }

  pub fn snapshot(&self) -> ConnectionState {
    self.tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
    self.tx.subscribe()
  }

  pub fn connectivity_writer(&self) -> ConnectivityWriter {
    ConnectivityWriter {
      tx: Arc::clone(&self.tx),
    }
  }

  pub fn sync_writer(&self) -> SyncWriter {
    SyncWriter {
      tx: Arc::clone(&self.tx),
    }
  }
}

impl Default for SharedState {
  fn default() -> Self {
    Self::new()
  }
}

/// Write access to `is_online`, `connection_quality` and `last_online_at`.
#[derive(Clone)]
pub struct ConnectivityWriter {
  tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectivityWriter {
  /// Record a new quality. Returns the previous quality.
  pub fn set_quality(&self, quality: ConnectionQuality, now: DateTime<Utc>) -> ConnectionQuality {
    let mut previous = quality;
    self.tx.send_if_modified(|state| {
      previous = state.connection_quality;
      let online = quality.is_online();
      if online {
        state.last_online_at = Some(now);
      }
      let changed = state.connection_quality != quality || state.is_online != online;
      state.connection_quality = quality;
      state.is_online = online;
      changed
    });
    previous
  }

  pub fn quality(&self) -> ConnectionQuality {
    self.tx.borrow().connection_quality
  }

  pub fn snapshot(&self) -> ConnectionState {
    self.tx.borrow().clone()
  }
}

/// Write access to `sync_status` and `pending_operations_count`.
#[derive(Clone)]
pub struct SyncWriter {
  tx: Arc<watch::Sender<ConnectionState>>,
}

impl SyncWriter {
  pub fn set_status(&self, status: SyncStatus) {
    self.tx.send_if_modified(|state| {
      let changed = state.sync_status != status;
      state.sync_status = status;
      changed
    });
  }

  pub fn status(&self) -> SyncStatus {
    self.tx.borrow().sync_status
  }

  pub fn set_pending(&self, count: usize) {
    self.tx.send_if_modified(|state| {
      let changed = state.pending_operations_count != count;
      state.pending_operations_count = count;
      changed
    });
  }

  pub fn increment_pending(&self) {
    self
      .tx
      .send_modify(|state| state.pending_operations_count += 1);
  }

  pub fn decrement_pending(&self) {
    self.tx.send_modify(|state| {
      state.pending_operations_count = state.pending_operations_count.saturating_sub(1)
    });
  }

  pub fn pending(&self) -> usize {
    self.tx.borrow().pending_operations_count
  }

  /// Read-only view of the quality owned by the connectivity monitor.
  pub fn quality(&self) -> ConnectionQuality {
    self.tx.borrow().connection_quality
  }

  pub fn snapshot(&self) -> ConnectionState {
    self.tx.borrow().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_state_is_offline_and_idle() {
    let state = SharedState::new().snapshot();
    assert!(!state.is_online);
    assert_eq!(state.connection_quality, ConnectionQuality::Offline);
    assert_eq!(state.sync_status, SyncStatus::Idle);
    assert_eq!(state.pending_operations_count, 0);
  }

  #[test]
  fn test_connectivity_writer_tracks_last_online() {
    let shared = SharedState::new();
    let writer = shared.connectivity_writer();
    let now = Utc::now();

    let previous = writer.set_quality(ConnectionQuality::Good, now);
    assert_eq!(previous, ConnectionQuality::Offline);

    let state = shared.snapshot();
    assert!(state.is_online);
    assert_eq!(state.last_online_at, Some(now));

    writer.set_quality(ConnectionQuality::Offline, now + chrono::Duration::seconds(5));
    let state = shared.snapshot();
    assert!(!state.is_online);
    assert_eq!(state.last_online_at, Some(now));
  }

  #[test]
  fn test_pending_count_never_underflows() {
    let shared = SharedState::new();
    let writer = shared.sync_writer();
    writer.decrement_pending();
    assert_eq!(writer.pending(), 0);
    writer.increment_pending();
    writer.increment_pending();
    writer.decrement_pending();
    assert_eq!(shared.snapshot().pending_operations_count, 1);
  }

  #[tokio::test]
  async fn test_subscribers_see_changes() {
    let shared = SharedState::new();
    let mut rx = shared.subscribe();
    shared.sync_writer().set_status(SyncStatus::Syncing);
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().sync_status, SyncStatus::Syncing);
  }

  #[test]
  fn test_resting_statuses_count_as_idle() {
    assert!(SyncStatus::Idle.is_idle());
    assert!(SyncStatus::Success.is_idle());
    assert!(SyncStatus::Error.is_idle());
    assert!(!SyncStatus::Syncing.is_idle());
    assert!(!SyncStatus::Paused.is_idle());
  }
}
