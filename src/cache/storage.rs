//! Persistent store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::entry::{partitions, CacheEntry, EntrySource};
use super::query::{Query, QueryResult};
use crate::clock::{Clock, SharedClock};

/// Bumped whenever `CACHE_SCHEMA` changes shape.
const SCHEMA_VERSION: i64 = 1;

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The database could not be opened or created.
  #[error("failed to open cache database: {0}")]
  Initialization(String),

  /// Another connection holds the database lock during schema setup.
  #[error("cache database is locked by another writer")]
  Blocked,

  /// The file was written by a newer build.
  #[error("cache schema version {found} is newer than supported version {supported}")]
  IncompatibleSchema { found: i64, supported: i64 },

  #[error("unknown store partition: {0}")]
  UnknownPartition(String),

  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("store lock poisoned")]
  LockPoisoned,
}

impl StoreError {
  /// Classify a rusqlite error raised while setting up the schema.
  fn from_setup(err: rusqlite::Error) -> Self {
    match err.sqlite_error_code() {
      Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::Blocked,
      _ => Self::Database(err),
    }
  }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable, partitioned key-value storage.
///
/// Every single-entry operation is atomic. Reads never return an entry whose
/// `expires_at` has passed; such entries are deleted as they are found.
pub trait Store: Send + Sync {
  /// Create partitions and indexes. Safe to call more than once.
  fn initialize(&self) -> StoreResult<()>;

  /// Insert or replace an entry by id.
  fn put(&self, store: &str, entry: &CacheEntry) -> StoreResult<()>;

  fn get(&self, store: &str, id: &str) -> StoreResult<Option<CacheEntry>>;

  /// All live entries in a partition.
  fn get_all(&self, store: &str) -> StoreResult<Vec<CacheEntry>>;

  /// Remove an entry. Missing ids are not an error.
  fn delete(&self, store: &str, id: &str) -> StoreResult<()>;

  fn delete_many(&self, store: &str, ids: &[String]) -> StoreResult<()>;

  fn clear(&self, store: &str) -> StoreResult<()>;

  /// Number of live entries in a partition.
  fn count(&self, store: &str) -> StoreResult<usize>;

  /// Delete every expired entry, in one partition or all of them.
  fn purge_expired(&self, store: Option<&str>) -> StoreResult<usize>;

  /// Insert only when no live entry with the same id exists.
  ///
  /// Returns whether the entry was written.
  fn insert_if_absent(&self, store: &str, entry: &CacheEntry) -> StoreResult<bool>;

  /// Domain partitions this store was configured with.
  fn partitions(&self) -> &[String];

  fn query(&self, store: &str, query: &Query) -> StoreResult<QueryResult> {
    Ok(query.apply(self.get_all(store)?))
  }
}

/// SQLite-based store implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  partitions: Vec<String>,
  clock: SharedClock,
}

impl SqliteStore {
  /// Open (or create) a store file. Call [`Store::initialize`] before use.
  pub fn open(path: &Path, partitions: Vec<String>, clock: SharedClock) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Initialization(format!(
          "failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)
      .map_err(|e| StoreError::Initialization(format!("{}: {}", path.display(), e)))?;
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| StoreError::Initialization(e.to_string()))?;
    let _mode: String = conn
      .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
      .map_err(StoreError::from_setup)?;

    Ok(Self::from_connection(conn, partitions, clock))
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory(partitions: Vec<String>, clock: SharedClock) -> StoreResult<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| StoreError::Initialization(e.to_string()))?;
    Ok(Self::from_connection(conn, partitions, clock))
  }

  fn from_connection(conn: Connection, partitions: Vec<String>, clock: SharedClock) -> Self {
    Self {
      conn: Mutex::new(conn),
      partitions,
      clock,
    }
  }

  /// Default database path under the user data directory.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("fieldsync").join("cache.db"))
  }

  /// Delete the database file and its journal so it can be recreated.
  pub fn destroy(path: &Path) -> StoreResult<()> {
    for suffix in ["", "-wal", "-shm"] {
      let mut target = path.as_os_str().to_owned();
      target.push(suffix);
      match std::fs::remove_file(PathBuf::from(target)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
          return Err(StoreError::Initialization(format!(
            "failed to remove {}: {}",
            path.display(),
            e
          )))
        }
      }
    }
    info!(path = %path.display(), "destroyed cache database");
    Ok(())
  }

  fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  fn check_partition(&self, store: &str) -> StoreResult<()> {
    if partitions::RESERVED.contains(&store) || self.partitions.iter().any(|p| p == store) {
      Ok(())
    } else {
      Err(StoreError::UnknownPartition(store.to_string()))
    }
  }

  fn now_millis(&self) -> i64 {
    self.clock.now().timestamp_millis()
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    expires_at INTEGER,
    dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    source TEXT NOT NULL,
    PRIMARY KEY (partition, id)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_timestamp
    ON cache_entries(partition, timestamp);

CREATE INDEX IF NOT EXISTS idx_cache_entries_dirty
    ON cache_entries(partition, dirty);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(partition, expires_at);
"#;

const SELECT_COLUMNS: &str = "id, data, timestamp, expires_at, dirty, version, source";

/// Row as stored, before the payload is parsed.
struct RawRow {
  id: String,
  data: String,
  timestamp: i64,
  expires_at: Option<i64>,
  dirty: bool,
  version: i64,
  source: String,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      data: row.get(1)?,
      timestamp: row.get(2)?,
      expires_at: row.get(3)?,
      dirty: row.get(4)?,
      version: row.get(5)?,
      source: row.get(6)?,
    })
  }

  fn is_expired(&self, now_millis: i64) -> bool {
    self.expires_at.is_some_and(|at| now_millis >= at)
  }

  /// Parse into an entry. `None` means the row is corrupt.
  fn decode(self) -> Option<CacheEntry> {
    let data: Value = serde_json::from_str(&self.data).ok()?;
    let timestamp = millis_to_datetime(self.timestamp)?;
    let expires_at = match self.expires_at {
      Some(ms) => Some(millis_to_datetime(ms)?),
      None => None,
    };
    let source = EntrySource::parse(&self.source)?;
    Some(CacheEntry {
      id: self.id,
      data,
      timestamp,
      expires_at,
      dirty: self.dirty,
      version: self.version,
      source,
    })
  }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms)
}

fn delete_rows(conn: &Connection, store: &str, ids: &[String]) -> StoreResult<()> {
  let mut stmt =
    conn.prepare_cached("DELETE FROM cache_entries WHERE partition = ? AND id = ?")?;
  for id in ids {
    stmt.execute(params![store, id])?;
  }
  Ok(())
}

/// Split rows into live entries and ids that must be removed.
fn sift(store: &str, rows: Vec<RawRow>, now_millis: i64) -> (Vec<CacheEntry>, Vec<String>) {
  let mut live = Vec::with_capacity(rows.len());
  let mut stale = Vec::new();
  for row in rows {
    if row.is_expired(now_millis) {
      debug!(store, id = %row.id, "lazily expiring cache entry");
      stale.push(row.id);
      continue;
    }
    let id = row.id.clone();
    match row.decode() {
      Some(entry) => live.push(entry),
      None => {
        warn!(store, id = %id, "dropping corrupt cache entry");
        stale.push(id);
      }
    }
  }
  (live, stale)
}

impl Store for SqliteStore {
  fn initialize(&self) -> StoreResult<()> {
    let mut conn = self.conn()?;

    let found: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(StoreError::from_setup)?;
    if found > SCHEMA_VERSION {
      return Err(StoreError::IncompatibleSchema {
        found,
        supported: SCHEMA_VERSION,
      });
    }

    let tx = conn
      .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
      .map_err(StoreError::from_setup)?;
    tx.execute_batch(CACHE_SCHEMA)
      .map_err(StoreError::from_setup)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(StoreError::from_setup)?;
    tx.commit().map_err(StoreError::from_setup)?;

    debug!(partitions = ?self.partitions, "cache store initialized");
    Ok(())
  }

  fn put(&self, store: &str, entry: &CacheEntry) -> StoreResult<()> {
    self.check_partition(store)?;
    let data = serde_json::to_string(&entry.data)?;
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, id, data, timestamp, expires_at, dirty, version, source)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        store,
        entry.id,
        data,
        entry.timestamp.timestamp_millis(),
        entry.expires_at.map(|at| at.timestamp_millis()),
        entry.dirty,
        entry.version,
        entry.source.as_str(),
      ],
    )?;
    Ok(())
  }

  fn get(&self, store: &str, id: &str) -> StoreResult<Option<CacheEntry>> {
    self.check_partition(store)?;
    let conn = self.conn()?;

    let row = conn
      .prepare_cached(&format!(
        "SELECT {} FROM cache_entries WHERE partition = ? AND id = ?",
        SELECT_COLUMNS
      ))?
      .query_row(params![store, id], RawRow::from_row)
      .optional()?;

    let Some(row) = row else {
      return Ok(None);
    };

    let (mut live, stale) = sift(store, vec![row], self.now_millis());
    delete_rows(&conn, store, &stale)?;
    Ok(live.pop())
  }

  fn get_all(&self, store: &str) -> StoreResult<Vec<CacheEntry>> {
    self.check_partition(store)?;
    let conn = self.conn()?;

    let rows: Vec<RawRow> = conn
      .prepare_cached(&format!(
        "SELECT {} FROM cache_entries WHERE partition = ? ORDER BY timestamp",
        SELECT_COLUMNS
      ))?
      .query_map(params![store], RawRow::from_row)?
      .collect::<rusqlite::Result<_>>()?;

    let (live, stale) = sift(store, rows, self.now_millis());
    delete_rows(&conn, store, &stale)?;
    Ok(live)
  }

  fn delete(&self, store: &str, id: &str) -> StoreResult<()> {
    self.check_partition(store)?;
    let conn = self.conn()?;
    delete_rows(&conn, store, &[id.to_string()])
  }

  fn delete_many(&self, store: &str, ids: &[String]) -> StoreResult<()> {
    self.check_partition(store)?;
    let conn = self.conn()?;
    delete_rows(&conn, store, ids)
  }

  fn clear(&self, store: &str) -> StoreResult<()> {
    self.check_partition(store)?;
    let conn = self.conn()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![store],
    )?;
    debug!(store, removed, "cleared store partition");
    Ok(())
  }

  fn count(&self, store: &str) -> StoreResult<usize> {
    self.check_partition(store)?;
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries
       WHERE partition = ? AND (expires_at IS NULL OR expires_at > ?)",
      params![store, self.now_millis()],
      |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
  }

  fn purge_expired(&self, store: Option<&str>) -> StoreResult<usize> {
    let now = self.now_millis();
    let conn = self.conn()?;
    let removed = match store {
      Some(store) => {
        self.check_partition(store)?;
        conn.execute(
          "DELETE FROM cache_entries
           WHERE partition = ? AND expires_at IS NOT NULL AND expires_at <= ?",
          params![store, now],
        )?
      }
      None => conn.execute(
        "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        params![now],
      )?,
    };
    Ok(removed)
  }

  fn insert_if_absent(&self, store: &str, entry: &CacheEntry) -> StoreResult<bool> {
    self.check_partition(store)?;
    let data = serde_json::to_string(&entry.data)?;
    let mut conn = self.conn()?;

    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    tx.execute(
      "DELETE FROM cache_entries
       WHERE partition = ? AND id = ? AND expires_at IS NOT NULL AND expires_at <= ?",
      params![store, entry.id, self.now_millis()],
    )?;
    let inserted = tx.execute(
      "INSERT OR IGNORE INTO cache_entries
         (partition, id, data, timestamp, expires_at, dirty, version, source)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        store,
        entry.id,
        data,
        entry.timestamp.timestamp_millis(),
        entry.expires_at.map(|at| at.timestamp_millis()),
        entry.dirty,
        entry.version,
        entry.source.as_str(),
      ],
    )?;
    tx.commit()?;
    Ok(inserted == 1)
  }

  fn partitions(&self) -> &[String] {
    &self.partitions
  }
}
