//! Offline-aware data access.
//!
//! [`OfflineClient`] is what screens talk to. Reads go to the cache or the
//! network depending on the [`CacheMode`] and the current connection quality;
//! writes made while offline are applied to the cache optimistically and
//! queued for replay.

pub mod envelope;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{
  CacheEntry, CacheManager, CacheResult, GetOptions, SetOptions, StoreError,
};
use crate::connectivity::{should_use_cache, CacheMode, ConnectivityMonitor};
use crate::net::{send_with_timeout, HttpMethod, HttpRequest, HttpTransport, TransportError};
use crate::sync::{NewOperation, OperationType, Priority, SyncEngine, SyncError};

/// Error type for façade calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  /// Offline and the call may not be queued.
  #[error("offline and the request cannot be queued")]
  Offline,

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("server answered {status}")]
  Http { status: u16, body: Value },

  #[error("local cache error: {0}")]
  Store(#[from] StoreError),

  #[error("could not queue request: {0}")]
  Sync(#[from] SyncError),

  #[error("unexpected response shape: {0}")]
  Decode(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Per-call options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
  /// Overrides the client-wide mode for this call
  pub mode: Option<CacheMode>,
  pub force_refresh: bool,
  /// Whether an offline write may be queued
  pub queueable: bool,
  pub priority: Priority,
  pub max_attempts: Option<u32>,
  /// Lifetime of the cached result; the cache default when `None`
  pub ttl: Option<Duration>,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      mode: None,
      force_refresh: false,
      queueable: true,
      priority: Priority::Normal,
      max_attempts: None,
      ttl: None,
    }
  }
}

impl RequestOptions {
  pub fn force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }

  pub fn mode(mut self, mode: CacheMode) -> Self {
    self.mode = Some(mode);
    self
  }

  pub fn not_queueable(mut self) -> Self {
    self.queueable = false;
    self
  }

  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }
}

pub struct OfflineClient {
  cache: Arc<CacheManager>,
  monitor: Arc<ConnectivityMonitor>,
  engine: Arc<SyncEngine>,
  transport: Arc<dyn HttpTransport>,
  mode: RwLock<CacheMode>,
  request_timeout: std::time::Duration,
}

impl OfflineClient {
  pub fn new(
    cache: Arc<CacheManager>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    transport: Arc<dyn HttpTransport>,
    mode: CacheMode,
    request_timeout: std::time::Duration,
  ) -> Self {
    Self {
      cache,
      monitor,
      engine,
      transport,
      mode: RwLock::new(mode),
      request_timeout,
    }
  }

  pub fn mode(&self) -> CacheMode {
    self.mode.read().map(|m| *m).unwrap_or_default()
  }

  pub fn set_mode(&self, mode: CacheMode) {
    if let Ok(mut current) = self.mode.write() {
      if *current != mode {
        info!(from = ?*current, to = ?mode, "cache mode changed");
        *current = mode;
      }
    }
  }

  fn is_offline(&self) -> bool {
    !self.monitor.quality().is_online()
  }

  fn set_options(&self, opts: &RequestOptions) -> SetOptions {
    match opts.ttl {
      Some(ttl) => self.cache.set_options().with_ttl(ttl),
      None => self.cache.set_options(),
    }
  }

  async fn send(
    &self,
    method: HttpMethod,
    url: &str,
    body: Option<Value>,
  ) -> ClientResult<Value> {
    let request = HttpRequest::new(method, url)
      .with_body(body)
      .with_timeout(self.request_timeout);
    let response = send_with_timeout(self.transport.as_ref(), request).await?;
    if response.is_success() {
      Ok(response.body)
    } else {
      Err(ClientError::Http {
        status: response.status,
        body: response.body,
      })
    }
  }

  // --------------------------------------------------------------------------
  // Reads
  // --------------------------------------------------------------------------

  /// Read one record.
  ///
  /// Returns `Ok(None)` when offline with nothing cached. A network failure
  /// falls back to the cached copy and only surfaces when there is none.
  pub async fn get<T>(
    &self,
    store: &str,
    id: &str,
    url: &str,
    opts: RequestOptions,
  ) -> ClientResult<Option<CacheResult<T>>>
  where
    T: DeserializeOwned,
  {
    let mode = opts.mode.unwrap_or_else(|| self.mode());
    let quality = self.monitor.quality();

    let consulted_cache = should_use_cache(mode, quality) && !opts.force_refresh;
    if consulted_cache {
      if let Some(entry) = self.cache.get_entry::<T>(store, id, GetOptions::default()) {
        return Ok(Some(CacheResult::from_cache(entry.data, Some(entry.timestamp))));
      }
    }

    if mode == CacheMode::FullOffline || !quality.is_online() {
      debug!(store, id, ?mode, ?quality, "read stays local");
      if consulted_cache {
        return Ok(None);
      }
      let cached = self.cache.get_entry::<T>(store, id, GetOptions::default());
      return Ok(cached.map(|entry| CacheResult::from_cache(entry.data, Some(entry.timestamp))));
    }

    let fetched = match self.send(HttpMethod::Get, url, None).await {
      Ok(body) => {
        let record = envelope::unwrap_record(&body);
        serde_json::from_value::<T>(record.clone())
          .map_err(ClientError::from)
          .map(|data| (data, record.clone()))
      }
      Err(e) => Err(e),
    };

    match fetched {
      Ok((data, record)) => {
        if let Err(e) = self.cache.set(store, id, &record, self.set_options(&opts)) {
          warn!(store, id, error = %e, "failed to cache fetched record");
        }
        Ok(Some(CacheResult::from_network(data)))
      }
      Err(e) => match self.cache.get_entry::<T>(store, id, GetOptions::default()) {
        Some(entry) => {
          warn!(store, id, error = %e, "fetch failed, serving cached copy");
          Ok(Some(CacheResult::fallback(entry.data, Some(entry.timestamp))))
        }
        None => Err(e),
      },
    }
  }

  /// Read a collection, caching each item under its `id`.
  pub async fn get_all<T>(
    &self,
    store: &str,
    url: &str,
    opts: RequestOptions,
  ) -> ClientResult<CacheResult<Vec<T>>>
  where
    T: DeserializeOwned,
  {
    let mode = opts.mode.unwrap_or_else(|| self.mode());
    let quality = self.monitor.quality();

    if should_use_cache(mode, quality) && !opts.force_refresh {
      let entries = self.cache.get_all_entries::<T>(store);
      if !entries.is_empty() || mode == CacheMode::FullOffline || !quality.is_online() {
        return Ok(cached_list(entries, CacheResult::from_cache));
      }
    }

    if mode == CacheMode::FullOffline || !quality.is_online() {
      debug!(store, ?mode, ?quality, "collection read stays local");
      return Ok(cached_list(
        self.cache.get_all_entries::<T>(store),
        CacheResult::from_cache,
      ));
    }

    let error = match self.send(HttpMethod::Get, url, None).await {
      Ok(body) => match envelope::extract_list(&body) {
        Some(items) => {
          let opts = self.set_options(&opts);
          for item in items {
            match envelope::record_id(item) {
              Some(id) => {
                if let Err(e) = self.cache.set(store, &id, item, opts) {
                  warn!(store, id = %id, error = %e, "failed to cache list item");
                }
              }
              None => debug!(store, "list item without id not cached"),
            }
          }
          match serde_json::from_value::<Vec<T>>(Value::Array(items.clone())) {
            Ok(data) => return Ok(CacheResult::from_network(data)),
            Err(e) => ClientError::Decode(e),
          }
        }
        None => {
          warn!(store, url, "unrecognized list envelope, serving cache");
          return Ok(cached_list(
            self.cache.get_all_entries::<T>(store),
            CacheResult::fallback,
          ));
        }
      },
      Err(e) => e,
    };

    let entries = self.cache.get_all_entries::<T>(store);
    if entries.is_empty() {
      return Err(error);
    }
    warn!(store, error = %error, "collection fetch failed, serving cache");
    Ok(cached_list(entries, CacheResult::fallback))
  }

  // --------------------------------------------------------------------------
  // Writes
  // --------------------------------------------------------------------------

  /// Create a record. An array body is a bulk create.
  ///
  /// Offline, each new record is cached under a `temp_` id and the request
  /// is queued; the returned data carries those ids.
  pub async fn post<B>(
    &self,
    store: &str,
    url: &str,
    body: &B,
    opts: RequestOptions,
  ) -> ClientResult<CacheResult<Value>>
  where
    B: Serialize + ?Sized,
  {
    let payload = serde_json::to_value(body)?;

    if !self.is_offline() {
      let response = self.send(HttpMethod::Post, url, Some(payload)).await?;
      self.cache_response(store, None, &response, &opts);
      return Ok(CacheResult::from_network(
        envelope::unwrap_record(&response).clone(),
      ));
    }
    if !opts.queueable {
      return Err(ClientError::Offline);
    }

    let (op_type, created, entity_id) = match &payload {
      Value::Array(items) => {
        let created: Vec<(String, Value)> = items.iter().map(with_temp_id).collect();
        (OperationType::BulkCreate, created, None)
      }
      item => {
        let (id, record) = with_temp_id(item);
        (OperationType::Create, vec![(id.clone(), record)], Some(id))
      }
    };

    // Queue before touching the cache so a failed enqueue leaves no orphan rows
    let op = self
      .operation(op_type, HttpMethod::Post, url, Some(payload), &opts)
      .entity(store, entity_id);
    self.engine.queue_operation(op)?;
    info!(store, url, "offline create queued");

    for (id, record) in &created {
      self.apply_local(store, id, record, &opts);
    }
    let mut records = created.into_iter().map(|(_, record)| record);
    let optimistic = match op_type {
      OperationType::BulkCreate => Value::Array(records.collect()),
      _ => records.next().unwrap_or(Value::Null),
    };
    Ok(CacheResult::optimistic(optimistic))
  }

  /// Replace a record.
  pub async fn put<B>(
    &self,
    store: &str,
    id: &str,
    url: &str,
    body: &B,
    opts: RequestOptions,
  ) -> ClientResult<CacheResult<Value>>
  where
    B: Serialize + ?Sized,
  {
    let payload = serde_json::to_value(body)?;

    if !self.is_offline() {
      let response = self.send(HttpMethod::Put, url, Some(payload)).await?;
      self.cache_response(store, Some(id), &response, &opts);
      return Ok(CacheResult::from_network(
        envelope::unwrap_record(&response).clone(),
      ));
    }
    if !opts.queueable {
      return Err(ClientError::Offline);
    }

    let previous = self.cache.get::<Value>(store, id, GetOptions::default());
    let mut record = match (&previous, &payload) {
      (Some(Value::Object(old)), Value::Object(new)) => {
        let mut merged = old.clone();
        merged.extend(new.clone());
        Value::Object(merged)
      }
      _ => payload.clone(),
    };
    if let Value::Object(map) = &mut record {
      map
        .entry("id")
        .or_insert_with(|| Value::String(id.to_string()));
    }

    let op = self
      .operation(OperationType::Update, HttpMethod::Put, url, Some(payload), &opts)
      .entity(store, Some(id.to_string()))
      .rollback(previous);
    self.engine.queue_operation(op)?;
    info!(store, id, "offline update queued");

    self.apply_local(store, id, &record, &opts);
    Ok(CacheResult::optimistic(record))
  }

  /// Delete a record. Offline, it disappears from the cache immediately.
  pub async fn delete(
    &self,
    store: &str,
    id: &str,
    url: &str,
    opts: RequestOptions,
  ) -> ClientResult<CacheResult<Value>> {
    if !self.is_offline() {
      let response = self.send(HttpMethod::Delete, url, None).await?;
      self.cache.invalidate(store, Some(id))?;
      return Ok(CacheResult::from_network(response));
    }
    if !opts.queueable {
      return Err(ClientError::Offline);
    }

    let previous = self.cache.get::<Value>(store, id, GetOptions::default());

    let op = self
      .operation(OperationType::Delete, HttpMethod::Delete, url, None, &opts)
      .entity(store, Some(id.to_string()))
      .rollback(previous);
    self.engine.queue_operation(op)?;
    info!(store, id, "offline delete queued");

    if let Err(e) = self.cache.invalidate(store, Some(id)) {
      warn!(store, id, error = %e, "queued delete not reflected in cache");
    }
    Ok(CacheResult::optimistic(Value::Null))
  }

  /// Apply an already queued write to the cache. The operation is durable at
  /// this point, so a cache failure is logged rather than returned.
  fn apply_local(&self, store: &str, id: &str, record: &Value, opts: &RequestOptions) {
    if let Err(e) = self.cache.set_local(store, id, record, opts.ttl) {
      warn!(store, id, error = %e, "queued write not reflected in cache");
    }
  }

  fn operation(
    &self,
    op_type: OperationType,
    method: HttpMethod,
    url: &str,
    payload: Option<Value>,
    opts: &RequestOptions,
  ) -> NewOperation {
    let mut op = NewOperation::new(op_type, method, url).priority(opts.priority);
    op.payload = payload;
    op.max_attempts = opts.max_attempts;
    op
  }

  /// Write a successful write response into the cache. Failures are logged:
  /// the server already holds the change.
  fn cache_response(&self, store: &str, id: Option<&str>, body: &Value, opts: &RequestOptions) {
    let set_opts = self.set_options(opts);
    let items = match body {
      Value::Array(items) => Some(items),
      _ => body.get("data").and_then(Value::as_array),
    };
    let result = match items {
      Some(items) => items.iter().try_for_each(|item| match envelope::record_id(item) {
        Some(item_id) => self.cache.set(store, &item_id, item, set_opts),
        None => Ok(()),
      }),
      None => {
        let record = envelope::unwrap_record(body);
        match id.map(str::to_string).or_else(|| envelope::record_id(record)) {
          Some(id) => self.cache.set(store, &id, record, set_opts),
          None => Ok(()),
        }
      }
    };
    if let Err(e) = result {
      warn!(store, error = %e, "failed to cache write response");
    }
  }
}

/// Give a new record a temporary id unless it already carries one.
fn with_temp_id(item: &Value) -> (String, Value) {
  let mut record = item.clone();
  if let Some(id) = envelope::record_id(&record) {
    return (id, record);
  }
  let id = envelope::temp_id();
  if let Value::Object(map) = &mut record {
    map.insert("id".to_string(), Value::String(id.clone()));
  }
  (id, record)
}

fn cached_list<T>(
  entries: Vec<CacheEntry<T>>,
  wrap: fn(Vec<T>, Option<DateTime<Utc>>) -> CacheResult<Vec<T>>,
) -> CacheResult<Vec<T>> {
  let cached_at = entries.iter().map(|e| e.timestamp).min();
  wrap(entries.into_iter().map(|e| e.data).collect(), cached_at)
}
