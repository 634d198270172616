//! Local persistent cache for offline use.
//!
//! This module provides:
//! - A partitioned SQLite store with per-entry metadata (timestamp, expiry,
//!   dirty flag, version, source)
//! - Lazy expiry: stale entries are never returned and are purged on access
//! - In-memory query (filter, sort, paginate) over a partition
//! - A cache manager with TTL defaults, dirty marking and hit/miss stats

mod entry;
mod manager;
mod query;
mod storage;
mod traits;

pub use entry::{partitions, CacheEntry, EntrySource};
pub use manager::{CacheManager, CacheStats, GetOptions, SetOptions, DEFAULT_TTL_SECS};
pub use query::{Query, QueryResult, SortOrder};
pub use storage::{SqliteStore, Store, StoreError, StoreResult};
pub use traits::{CacheResult, CacheSource, Cacheable};
