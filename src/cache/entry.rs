//! Stored cache rows and the reserved partition names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Partitions that always exist regardless of configuration.
pub mod partitions {
  /// Key-value metadata (sync lease, bookkeeping)
  pub const METADATA: &str = "metadata";
  /// Pending mutations awaiting replay
  pub const SYNC_QUEUE: &str = "sync_queue";
  /// Mutations dropped after a terminal failure
  pub const SYNC_FAILED: &str = "sync_failed";

  pub const PATIENTS: &str = "patients";
  pub const DRUGS: &str = "drugs";
  pub const OPERATIONS: &str = "operations";

  pub const RESERVED: [&str; 3] = [METADATA, SYNC_QUEUE, SYNC_FAILED];
}

/// Where an entry's payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntrySource {
  Server,
  Local,
}

impl EntrySource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Server => "SERVER",
      Self::Local => "LOCAL",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "SERVER" => Some(Self::Server),
      "LOCAL" => Some(Self::Local),
      _ => None,
    }
  }
}

/// A single row in a store partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T = Value> {
  pub id: String,
  pub data: T,
  pub timestamp: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
  pub dirty: bool,
  pub version: i64,
  pub source: EntrySource,
}

impl<T> CacheEntry<T> {
  /// A clean, version 1 entry.
  pub fn new(
    id: impl Into<String>,
    data: T,
    timestamp: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    source: EntrySource,
  ) -> Self {
    Self {
      id: id.into(),
      data,
      timestamp,
      expires_at,
      dirty: false,
      version: 1,
      source,
    }
  }

  /// An entry is expired once `now` reaches `expires_at`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
    CacheEntry {
      id: self.id,
      data: f(self.data),
      timestamp: self.timestamp,
      expires_at: self.expires_at,
      dirty: self.dirty,
      version: self.version,
      source: self.source,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_expiry_boundary_is_inclusive() {
    let now = Utc::now();
    let entry = CacheEntry::new("a", 1, now, Some(now + Duration::seconds(1)), EntrySource::Server);
    assert!(!entry.is_expired(now));
    assert!(entry.is_expired(now + Duration::seconds(1)));
  }

  #[test]
  fn test_no_expiry_never_expires() {
    let now = Utc::now();
    let entry = CacheEntry::new("a", 1, now, None, EntrySource::Local);
    assert!(!entry.is_expired(now + Duration::days(3650)));
  }

  #[test]
  fn test_source_string_roundtrip() {
    for source in [EntrySource::Server, EntrySource::Local] {
      assert_eq!(EntrySource::parse(source.as_str()), Some(source));
    }
    assert_eq!(EntrySource::parse("remote"), None);
  }
}
