//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for domain records that can be cached.
///
/// Implementors name the partition they live in and provide a unique key
/// within it.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this record (e.g., patient id)
  fn cache_key(&self) -> String;

  /// Partition holding records of this type (e.g., "patients")
  fn store_name() -> &'static str;
}

/// Result from a cache-aware read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at,
    }
  }

  /// Cached data served because the network request failed.
  pub fn fallback(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at,
    }
  }

  /// Result of a local write that has not reached the server yet.
  pub fn optimistic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Optimistic,
      cached_at: None,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, chosen by policy
  Cache,
  /// Network failed or unreachable, serving cached data
  Fallback,
  /// Local write queued for replay
  Optimistic,
}
