//! Replays queued mutations against the backend.
//!
//! A run walks the due operations in dequeue order, a batch at a time,
//! strictly one request at a time. Each outcome is classified:
//!
//! - 2xx: the operation is removed and the response reconciled into the cache
//! - network failure, timeout, 5xx, 429: rescheduled with exponential backoff
//!   until `max_attempts` is reached
//! - any other status, or attempts exhausted: moved to the failed bucket
//!
//! Only one run executes at a time per process (an in-memory flag) and per
//! store file (a lease row in the metadata partition).

use chrono::Duration;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::error::{SyncError, SyncResult};
use super::operation::{ConflictStrategy, NewOperation, OperationType, QueuedOperation};
use super::queue::OperationQueue;
use crate::cache::{partitions, CacheEntry, CacheManager, EntrySource, StoreError, StoreResult};
use crate::client::envelope;
use crate::clock::{Clock, SharedClock};
use crate::connectivity::{should_sync_now, ConnectivityMonitor, ListenerId};
use crate::net::{is_recoverable_status, send_with_timeout, HttpTransport};
use crate::state::{SyncStatus, SyncWriter};

const LEASE_ID: &str = "sync_lease";

/// Tuning for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub batch_size: usize,
  pub request_timeout: std::time::Duration,
  /// Used when an operation does not carry its own limit
  pub max_attempts: u32,
  pub retry: RetryPolicy,
  pub sweep_interval: std::time::Duration,
  pub lease_ttl: Duration,
  pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      batch_size: 10,
      request_timeout: std::time::Duration::from_secs(30),
      max_attempts: 5,
      retry: RetryPolicy::default(),
      sweep_interval: std::time::Duration::from_secs(300),
      lease_ttl: Duration::seconds(120),
      conflict_strategy: ConflictStrategy::LastWriteWins,
    }
  }
}

/// Outcome counters for one queue run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Operations attempted
  pub processed: usize,
  pub succeeded: usize,
  /// Failed recoverably and scheduled for another attempt
  pub rescheduled: usize,
  /// Moved to the failed bucket
  pub dropped: usize,
  /// Left in the queue because their backoff had not elapsed
  pub skipped: usize,
  /// Stopped early because connectivity degraded or sync was paused
  pub aborted: bool,
}

enum Outcome {
  Succeeded,
  Rescheduled,
  Dropped,
}

/// Resets the in-flight flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

pub struct SyncEngine {
  queue: OperationQueue,
  cache: Arc<CacheManager>,
  transport: Arc<dyn HttpTransport>,
  writer: SyncWriter,
  clock: SharedClock,
  config: SyncConfig,
  owner: String,
  processing: AtomicBool,
  paused: AtomicBool,
  runs: AtomicU64,
  sweep: Mutex<Option<JoinHandle<()>>>,
  listener: Mutex<Option<(Arc<ConnectivityMonitor>, ListenerId)>>,
}

impl SyncEngine {
  pub fn new(
    cache: Arc<CacheManager>,
    transport: Arc<dyn HttpTransport>,
    writer: SyncWriter,
    clock: SharedClock,
    config: SyncConfig,
  ) -> Self {
    if config.conflict_strategy != ConflictStrategy::LastWriteWins {
      warn!(
        strategy = ?config.conflict_strategy,
        "conflict strategy not supported, server responses overwrite local entries"
      );
    }
    Self {
      queue: OperationQueue::new(Arc::clone(cache.store())).with_writer(writer.clone()),
      cache,
      transport,
      writer,
      clock,
      config,
      owner: Uuid::new_v4().to_string(),
      processing: AtomicBool::new(false),
      paused: AtomicBool::new(false),
      runs: AtomicU64::new(0),
      sweep: Mutex::new(None),
      listener: Mutex::new(None),
    }
  }

  /// Publish the persisted queue length. Returns it.
  pub fn initialize(&self) -> SyncResult<usize> {
    let pending = self.queue.len()?;
    self.writer.set_pending(pending);
    if pending > 0 {
      info!(pending, "loaded pending operations");
    }
    Ok(pending)
  }

  /// Hook into connectivity changes and start the periodic sweep.
  pub fn start(self: &Arc<Self>, monitor: &Arc<ConnectivityMonitor>) {
    let engine = Arc::downgrade(self);
    let id = monitor.subscribe(move |change| {
      if !change.became_good() {
        return;
      }
      let Some(engine) = engine.upgrade() else {
        return;
      };
      if change.state.pending_operations_count == 0 {
        debug!("back online with an empty queue");
        return;
      }
      engine.trigger("reconnected");
    });

    if let Ok(mut listener) = self.listener.lock() {
      if let Some((previous, previous_id)) = listener.replace((Arc::clone(monitor), id)) {
        previous.unsubscribe(previous_id);
      }
    }

    let engine = Arc::clone(self);
    let interval = self.config.sweep_interval;
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        engine.sweep().await;
      }
    });
    if let Ok(mut sweep) = self.sweep.lock() {
      if let Some(previous) = sweep.replace(task) {
        previous.abort();
      }
    }
  }

  /// Stop the sweep and detach from the monitor. Safe to call repeatedly.
  pub fn stop(&self) {
    if let Some(task) = self.sweep.lock().ok().and_then(|mut s| s.take()) {
      task.abort();
    }
    if let Some((monitor, id)) = self.listener.lock().ok().and_then(|mut l| l.take()) {
      monitor.unsubscribe(id);
    }
  }

  async fn sweep(&self) {
    if self.is_paused() || !should_sync_now(self.writer.quality(), self.writer.status()) {
      return;
    }
    match self.queue.is_empty() {
      Ok(true) => {}
      Ok(false) => match self.process_queue().await {
        Ok(report) => debug!(?report, "sweep run finished"),
        Err(e) => debug!(error = %e, "sweep run skipped"),
      },
      Err(e) => warn!(error = %e, "sweep could not read the queue"),
    }
  }

  /// Persist a mutation for replay and kick off a run when conditions allow.
  pub fn queue_operation(self: &Arc<Self>, new: NewOperation) -> SyncResult<QueuedOperation> {
    let now = self.clock.now();
    let op = QueuedOperation {
      id: Uuid::new_v4().to_string(),
      op_type: new.op_type,
      endpoint: new.endpoint,
      method: new.method,
      payload: new.payload,
      priority: new.priority,
      attempts: 0,
      max_attempts: new.max_attempts.unwrap_or(self.config.max_attempts),
      created_at: now,
      scheduled_at: now,
      last_attempt_at: None,
      error: None,
      metadata: new.metadata,
    };
    self.queue.save(&op)?;
    self.writer.increment_pending();
    info!(
      id = %op.id,
      op_type = ?op.op_type,
      endpoint = %op.endpoint,
      priority = ?op.priority,
      "queued operation"
    );

    if !self.is_paused() && should_sync_now(self.writer.quality(), self.writer.status()) {
      self.trigger("queued");
    }
    Ok(op)
  }

  /// Run the queue in the background, ignoring refusals.
  fn trigger(self: &Arc<Self>, reason: &'static str) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      debug!(reason, "no runtime, sync deferred to the next sweep");
      return;
    };
    let engine = Arc::clone(self);
    handle.spawn(async move {
      match engine.process_queue().await {
        Ok(report) => debug!(reason, ?report, "triggered run finished"),
        Err(e) => debug!(reason, error = %e, "triggered run skipped"),
      }
    });
  }

  /// Replay every due operation.
  pub async fn process_queue(&self) -> SyncResult<SyncReport> {
    if self.is_paused() {
      return Err(SyncError::Paused);
    }
    let quality = self.writer.quality();
    if !quality.is_good() {
      return Err(SyncError::NotConnected(quality));
    }
    if self
      .processing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Err(SyncError::AlreadyProcessing);
    }
    let _guard = RunGuard(&self.processing);

    self.acquire_lease()?;
    self.runs.fetch_add(1, Ordering::Relaxed);
    self.writer.set_status(SyncStatus::Syncing);

    let result = self.run().await;

    if let Err(e) = self.release_lease() {
      warn!(error = %e, "failed to release sync lease");
    }

    let status = match &result {
      _ if self.is_paused() => SyncStatus::Paused,
      Ok(report) if report.aborted || report.rescheduled + report.dropped > 0 => SyncStatus::Error,
      Ok(report) if report.processed == 0 => SyncStatus::Idle,
      Ok(_) => SyncStatus::Success,
      Err(_) => SyncStatus::Error,
    };
    self.writer.set_status(status);

    if let Ok(report) = &result {
      info!(
        processed = report.processed,
        succeeded = report.succeeded,
        rescheduled = report.rescheduled,
        dropped = report.dropped,
        skipped = report.skipped,
        aborted = report.aborted,
        "sync run finished"
      );
    }
    result
  }

  async fn run(&self) -> SyncResult<SyncReport> {
    let mut report = SyncReport::default();
    let mut attempted = HashSet::new();

    'batches: loop {
      let now = self.clock.now();
      let batch: Vec<QueuedOperation> = self
        .queue
        .due(now)?
        .into_iter()
        .filter(|op| !attempted.contains(&op.id))
        .take(self.config.batch_size.max(1))
        .collect();
      if batch.is_empty() {
        break;
      }
      self.renew_lease()?;
      debug!(size = batch.len(), "processing batch");

      for op in batch {
        if self.is_paused() {
          info!("sync paused mid-run");
          report.aborted = true;
          break 'batches;
        }
        let quality = self.writer.quality();
        if !quality.is_good() {
          info!(?quality, "connectivity degraded, stopping sync run");
          report.aborted = true;
          break 'batches;
        }

        attempted.insert(op.id.clone());
        report.processed += 1;
        match self.replay(op).await {
          Ok(Outcome::Succeeded) => report.succeeded += 1,
          Ok(Outcome::Rescheduled) => report.rescheduled += 1,
          Ok(Outcome::Dropped) => report.dropped += 1,
          Err(e) => error!(error = %e, "failed to record replay outcome"),
        }
      }
    }

    report.skipped = self
      .queue
      .pending()?
      .iter()
      .filter(|op| !attempted.contains(&op.id))
      .count();
    Ok(report)
  }

  async fn replay(&self, op: QueuedOperation) -> StoreResult<Outcome> {
    let request = op.to_request().with_timeout(self.config.request_timeout);
    debug!(id = %op.id, method = op.method.as_str(), endpoint = %op.endpoint, attempt = op.attempts + 1, "replaying operation");

    match send_with_timeout(self.transport.as_ref(), request).await {
      Ok(response) if response.is_success() => {
        self.queue.remove(&op.id)?;
        self.writer.decrement_pending();
        info!(id = %op.id, status = response.status, "operation synced");
        self.reconcile(&op, &response.body);
        Ok(Outcome::Succeeded)
      }
      Ok(response) => {
        let recoverable = is_recoverable_status(response.status);
        self.record_failure(op, format!("HTTP {}", response.status), recoverable)
      }
      Err(e) => self.record_failure(op, e.to_string(), true),
    }
  }

  fn record_failure(
    &self,
    mut op: QueuedOperation,
    reason: String,
    recoverable: bool,
  ) -> StoreResult<Outcome> {
    let now = self.clock.now();
    op.attempts += 1;
    op.last_attempt_at = Some(now);
    op.error = Some(reason);

    if recoverable && !op.attempts_exhausted() {
      let delay = self.config.retry.delay_for(op.attempts);
      op.scheduled_at = now + delay;
      self.queue.save(&op)?;
      warn!(
        id = %op.id,
        attempts = op.attempts,
        max_attempts = op.max_attempts,
        delay_ms = delay.num_milliseconds(),
        error = op.error.as_deref().unwrap_or_default(),
        "operation failed, rescheduled"
      );
      return Ok(Outcome::Rescheduled);
    }

    self.queue.move_to_failed(&op)?;
    self.writer.decrement_pending();
    warn!(
      id = %op.id,
      attempts = op.attempts,
      recoverable,
      error = op.error.as_deref().unwrap_or_default(),
      "operation dropped to failed bucket"
    );
    Ok(Outcome::Dropped)
  }

  /// Write the authoritative server result into the cache.
  fn reconcile(&self, op: &QueuedOperation, body: &Value) {
    let Some(store) = op.metadata.entity_type.as_deref() else {
      return;
    };
    let entity_id = op.metadata.entity_id.as_deref();
    let record = envelope::unwrap_record(body);
    let opts = self.cache.set_options();

    let result = match op.op_type {
      OperationType::Create => match envelope::record_id(record) {
        Some(id) => self.cache.set(store, &id, record, opts).and_then(|()| {
          match entity_id {
            Some(temp) if temp != id => self.cache.invalidate(store, Some(temp)),
            _ => Ok(()),
          }
        }),
        None => {
          debug!(id = %op.id, "create response carried no id, cache left as is");
          Ok(())
        }
      },
      OperationType::Update => {
        match entity_id.map(str::to_string).or_else(|| envelope::record_id(record)) {
          Some(id) => self.cache.set(store, &id, record, opts),
          None => Ok(()),
        }
      }
      OperationType::Delete => match entity_id {
        Some(id) => self.cache.invalidate(store, Some(id)),
        None => Ok(()),
      },
      OperationType::BulkCreate | OperationType::BulkUpdate => {
        envelope::extract_list(body).map_or(Ok(()), |items| {
          items.iter().try_for_each(|item| match envelope::record_id(item) {
            Some(id) => self.cache.set(store, &id, item, opts),
            None => Ok(()),
          })
        })
      }
      OperationType::BulkDelete => {
        let ids: Vec<String> = op
          .payload
          .as_ref()
          .and_then(|p| p.get("ids"))
          .and_then(Value::as_array)
          .map(|ids| ids.iter().filter_map(envelope::id_string).collect())
          .unwrap_or_default();
        ids
          .iter()
          .try_for_each(|id| self.cache.invalidate(store, Some(id)))
      }
    };

    if let Err(e) = result {
      warn!(id = %op.id, store, error = %e, "failed to reconcile cache after sync");
    }
  }

  // --------------------------------------------------------------------------
  // Lease
  // --------------------------------------------------------------------------

  fn lease_entry(&self) -> CacheEntry {
    let now = self.clock.now();
    CacheEntry::new(
      LEASE_ID,
      json!({ "owner": self.owner }),
      now,
      Some(now + self.config.lease_ttl),
      EntrySource::Local,
    )
  }

  fn lease_owner(&self) -> StoreResult<Option<String>> {
    Ok(
      self
        .cache
        .store()
        .get(partitions::METADATA, LEASE_ID)?
        .and_then(|entry| entry.data.get("owner").and_then(Value::as_str).map(str::to_string)),
    )
  }

  fn acquire_lease(&self) -> SyncResult<()> {
    let store = self.cache.store();
    if store.insert_if_absent(partitions::METADATA, &self.lease_entry())? {
      return Ok(());
    }
    match self.lease_owner()? {
      Some(owner) if owner == self.owner => {
        store.put(partitions::METADATA, &self.lease_entry())?;
        Ok(())
      }
      Some(owner) => {
        debug!(%owner, "sync lease held elsewhere");
        Err(SyncError::LeaseHeld)
      }
      // Expired between the two calls
      None if store.insert_if_absent(partitions::METADATA, &self.lease_entry())? => Ok(()),
      None => Err(SyncError::LeaseHeld),
    }
  }

  fn renew_lease(&self) -> SyncResult<()> {
    match self.lease_owner()? {
      Some(owner) if owner != self.owner => Err(SyncError::LeaseHeld),
      _ => {
        self
          .cache
          .store()
          .put(partitions::METADATA, &self.lease_entry())?;
        Ok(())
      }
    }
  }

  fn release_lease(&self) -> Result<(), StoreError> {
    if self.lease_owner()?.as_deref() == Some(self.owner.as_str()) {
      self.cache.store().delete(partitions::METADATA, LEASE_ID)?;
    }
    Ok(())
  }

  // --------------------------------------------------------------------------
  // Operator controls
  // --------------------------------------------------------------------------

  /// Block new runs. A run in progress stops before its next operation.
  pub fn pause(&self) {
    self.paused.store(true, Ordering::SeqCst);
    if !self.is_processing() {
      self.writer.set_status(SyncStatus::Paused);
    }
    info!("sync paused");
  }

  pub fn resume(self: &Arc<Self>) {
    self.paused.store(false, Ordering::SeqCst);
    if self.writer.status() == SyncStatus::Paused {
      self.writer.set_status(SyncStatus::Idle);
    }
    info!("sync resumed");
    if self.writer.pending() > 0 && should_sync_now(self.writer.quality(), self.writer.status()) {
      self.trigger("resumed");
    }
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  pub fn is_processing(&self) -> bool {
    self.processing.load(Ordering::SeqCst)
  }

  /// Number of runs started since construction.
  pub fn run_count(&self) -> u64 {
    self.runs.load(Ordering::Relaxed)
  }

  pub fn pending_operations(&self) -> SyncResult<Vec<QueuedOperation>> {
    Ok(self.queue.pending()?)
  }

  pub fn failed_operations(&self) -> SyncResult<Vec<QueuedOperation>> {
    Ok(self.queue.failed()?)
  }

  /// Put a failed operation back in the queue with a fresh attempt budget.
  ///
  /// Returns `false` when no failed operation has that id.
  pub fn retry_failed(self: &Arc<Self>, id: &str) -> SyncResult<bool> {
    let Some(mut op) = self.queue.take_failed(id)? else {
      return Ok(false);
    };
    op.attempts = 0;
    op.error = None;
    op.scheduled_at = self.clock.now();
    self.queue.save(&op)?;
    self.writer.increment_pending();
    info!(id, "failed operation requeued");

    if !self.is_paused() && should_sync_now(self.writer.quality(), self.writer.status()) {
      self.trigger("retry");
    }
    Ok(true)
  }

  pub fn clear_failed(&self) -> SyncResult<usize> {
    let removed = self.queue.clear_failed()?;
    info!(removed, "cleared failed operations");
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{GetOptions, SqliteStore, Store};
  use crate::clock::ManualClock;
  use crate::connectivity::{ConnectionQuality, MonitorConfig};
  use crate::net::{HttpMethod, TransportError};
  use crate::state::SharedState;
  use crate::sync::operation::Priority;
  use crate::testing::MockTransport;

  struct Harness {
    engine: Arc<SyncEngine>,
    transport: Arc<MockTransport>,
    state: SharedState,
    clock: Arc<ManualClock>,
    cache: Arc<CacheManager>,
  }

  fn harness_with(config: SyncConfig) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store: Arc<dyn Store> = Arc::new(
      SqliteStore::open_in_memory(vec![partitions::PATIENTS.to_string()], clock.clone()).unwrap(),
    );
    store.initialize().unwrap();
    let cache = Arc::new(CacheManager::new(store, clock.clone()));
    let transport = Arc::new(MockTransport::new());
    let state = SharedState::new();
    let engine = Arc::new(SyncEngine::new(
      cache.clone(),
      transport.clone(),
      state.sync_writer(),
      clock.clone(),
      config,
    ));
    Harness {
      engine,
      transport,
      state,
      clock,
      cache,
    }
  }

  fn harness() -> Harness {
    harness_with(SyncConfig::default())
  }

  impl Harness {
    fn set_quality(&self, quality: ConnectionQuality) {
      self
        .state
        .connectivity_writer()
        .set_quality(quality, self.clock.now());
    }
  }

  fn create_patient(temp_id: &str) -> NewOperation {
    NewOperation::new(OperationType::Create, HttpMethod::Post, "/api/patients")
      .payload(json!({"name": "Bob"}))
      .entity(partitions::PATIENTS, Some(temp_id.to_string()))
  }

  #[tokio::test]
  async fn test_successful_replay_decrements_pending_by_one() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.engine.queue_operation(create_patient("temp_2")).unwrap();
    assert_eq!(h.state.snapshot().pending_operations_count, 2);

    h.transport.reply(HttpMethod::Post, "/api/patients", 201, json!({"id": "p1", "name": "Bob"}));
    h.transport.reply(HttpMethod::Post, "/api/patients", 503, Value::Null);
    h.set_quality(ConnectionQuality::Good);

    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.rescheduled, 1);
    assert_eq!(h.state.snapshot().pending_operations_count, 1);
    assert_eq!(h.engine.pending_operations().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_create_reconciles_cache_and_drops_temp_entry() {
    let h = harness();
    h.cache
      .set_local(partitions::PATIENTS, "temp_1", &json!({"name": "Bob"}), None)
      .unwrap();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.transport.reply(
      HttpMethod::Post,
      "/api/patients",
      201,
      json!({"data": {"id": 42, "name": "Bob"}}),
    );
    h.set_quality(ConnectionQuality::Excellent);

    h.engine.process_queue().await.unwrap();

    let cached: Option<Value> = h.cache.get(partitions::PATIENTS, "42", GetOptions::default());
    assert_eq!(cached, Some(json!({"id": 42, "name": "Bob"})));
    let temp: Option<Value> = h.cache.get(partitions::PATIENTS, "temp_1", GetOptions::default());
    assert!(temp.is_none());
    assert_eq!(h.state.snapshot().sync_status, SyncStatus::Success);
  }

  #[tokio::test]
  async fn test_update_and_delete_reconcile_by_entity_id() {
    let h = harness();
    h.cache
      .set(partitions::PATIENTS, "7", &json!({"name": "Old"}), h.cache.set_options())
      .unwrap();
    h.cache
      .set(partitions::PATIENTS, "8", &json!({"name": "Gone"}), h.cache.set_options())
      .unwrap();

    h.engine
      .queue_operation(
        NewOperation::new(OperationType::Update, HttpMethod::Put, "/api/patients/7")
          .payload(json!({"name": "New"}))
          .entity(partitions::PATIENTS, Some("7".into())),
      )
      .unwrap();
    h.engine
      .queue_operation(
        NewOperation::new(OperationType::Delete, HttpMethod::Delete, "/api/patients/8")
          .entity(partitions::PATIENTS, Some("8".into())),
      )
      .unwrap();
    h.transport.reply(HttpMethod::Put, "/api/patients/7", 200, json!({"id": 7, "name": "New"}));
    h.transport.reply(HttpMethod::Delete, "/api/patients/8", 204, Value::Null);
    h.set_quality(ConnectionQuality::Good);

    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 2);

    let updated: Option<Value> = h.cache.get(partitions::PATIENTS, "7", GetOptions::default());
    assert_eq!(updated.unwrap()["name"], "New");
    let deleted: Option<Value> = h.cache.get(partitions::PATIENTS, "8", GetOptions::default());
    assert!(deleted.is_none());
  }

  #[tokio::test]
  async fn test_recoverable_failures_back_off_until_dropped() {
    let h = harness_with(SyncConfig {
      retry: RetryPolicy::new(Duration::seconds(1), Duration::seconds(3)),
      ..SyncConfig::default()
    });
    h.engine
      .queue_operation(create_patient("temp_1").max_attempts(5))
      .unwrap();
    h.transport.reply(HttpMethod::Post, "/api/patients", 503, Value::Null);
    h.set_quality(ConnectionQuality::Good);

    let mut delays = Vec::new();
    for _ in 0..4 {
      let report = h.engine.process_queue().await.unwrap();
      assert_eq!(report.rescheduled, 1);
      let op = h.engine.pending_operations().unwrap().remove(0);
      let delay = op.scheduled_at - op.last_attempt_at.unwrap();
      delays.push(delay.num_seconds());

      // Not due yet: nothing is replayed
      let report = h.engine.process_queue().await.unwrap();
      assert_eq!(report.processed, 0);
      assert_eq!(report.skipped, 1);

      h.clock.advance(delay);
    }
    assert_eq!(delays, vec![1, 2, 3, 3]);

    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert!(h.engine.pending_operations().unwrap().is_empty());
    assert_eq!(h.state.snapshot().pending_operations_count, 0);
    assert_eq!(h.transport.calls_to(HttpMethod::Post, "/api/patients"), 5);

    let failed = h.engine.failed_operations().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 5);
    assert_eq!(failed[0].error.as_deref(), Some("HTTP 503"));
  }

  #[tokio::test]
  async fn test_terminal_status_drops_immediately() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.transport.reply(HttpMethod::Post, "/api/patients", 422, json!({"error": "invalid"}));
    h.set_quality(ConnectionQuality::Good);

    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(h.transport.calls_to(HttpMethod::Post, "/api/patients"), 1);
    assert_eq!(h.state.snapshot().sync_status, SyncStatus::Error);
  }

  #[tokio::test]
  async fn test_network_errors_are_recoverable() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.transport.fail(
      HttpMethod::Post,
      "/api/patients",
      TransportError::Network("connection reset".into()),
    );
    h.set_quality(ConnectionQuality::Good);

    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.rescheduled, 1);
    let op = &h.engine.pending_operations().unwrap()[0];
    assert_eq!(op.attempts, 1);
    assert!(op.error.as_deref().unwrap().contains("connection reset"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_run_is_rejected() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.engine.queue_operation(create_patient("temp_2")).unwrap();
    h.transport.reply(HttpMethod::Post, "/api/patients", 201, json!({"id": "p"}));
    h.transport.set_latency(std::time::Duration::from_millis(100));
    h.set_quality(ConnectionQuality::Good);

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.process_queue().await });
    tokio::task::yield_now().await;
    assert!(h.engine.is_processing());

    let second = h.engine.process_queue().await;
    assert!(matches!(second, Err(SyncError::AlreadyProcessing)));

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(h.transport.calls_to(HttpMethod::Post, "/api/patients"), 2);
    assert!(!h.engine.is_processing());
  }

  #[tokio::test]
  async fn test_refuses_when_connection_is_poor() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.set_quality(ConnectionQuality::Poor);

    let result = h.engine.process_queue().await;
    assert!(matches!(
      result,
      Err(SyncError::NotConnected(ConnectionQuality::Poor))
    ));
    assert!(h.transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_higher_priority_runs_first() {
    let h = harness();
    h.engine
      .queue_operation(NewOperation::new(OperationType::Create, HttpMethod::Post, "/api/normal"))
      .unwrap();
    h.clock.advance(Duration::seconds(1));
    h.engine
      .queue_operation(
        NewOperation::new(OperationType::Create, HttpMethod::Post, "/api/high")
          .priority(Priority::High),
      )
      .unwrap();
    h.transport.reply(HttpMethod::Post, "/api/normal", 201, Value::Null);
    h.transport.reply(HttpMethod::Post, "/api/high", 201, Value::Null);
    h.set_quality(ConnectionQuality::Good);

    h.engine.process_queue().await.unwrap();
    let order: Vec<String> = h.transport.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(order, vec!["/api/high", "/api/normal"]);
  }

  #[tokio::test]
  async fn test_batches_cover_whole_queue() {
    let h = harness_with(SyncConfig {
      batch_size: 2,
      ..SyncConfig::default()
    });
    for i in 0..5 {
      h.engine
        .queue_operation(create_patient(&format!("temp_{}", i)))
        .unwrap();
    }
    h.transport.reply(HttpMethod::Post, "/api/patients", 201, Value::Null);
    h.set_quality(ConnectionQuality::Good);

    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.processed, 5);
    assert_eq!(report.succeeded, 5);
    assert_eq!(h.state.snapshot().pending_operations_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_triggers_exactly_one_run() {
    let h = harness();
    let monitor = Arc::new(ConnectivityMonitor::new(
      h.transport.clone(),
      h.state.connectivity_writer(),
      h.clock.clone(),
      MonitorConfig::default(),
    ));
    h.engine.start(&monitor);

    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.transport.reply(HttpMethod::Get, "/api/health", 200, Value::Null);
    h.transport.reply(HttpMethod::Post, "/api/patients", 201, json!({"id": "p1"}));

    monitor.check_now().await;
    // Still online: no second transition
    monitor.check_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    assert_eq!(h.engine.run_count(), 1);
    assert_eq!(h.transport.calls_to(HttpMethod::Post, "/api/patients"), 1);
    assert_eq!(h.state.snapshot().pending_operations_count, 0);
    h.engine.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_through_poor_triggers_run() {
    let h = harness();
    let monitor = Arc::new(ConnectivityMonitor::new(
      h.transport.clone(),
      h.state.connectivity_writer(),
      h.clock.clone(),
      MonitorConfig::default(),
    ));
    h.engine.start(&monitor);

    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.transport.reply(HttpMethod::Get, "/api/health", 200, Value::Null);
    h.transport.reply(HttpMethod::Post, "/api/patients", 201, json!({"id": "p1"}));

    h.transport.set_latency(std::time::Duration::from_millis(500));
    assert_eq!(monitor.check_now().await, ConnectionQuality::Poor);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(h.engine.run_count(), 0);

    h.transport.set_latency(std::time::Duration::from_millis(10));
    assert_eq!(monitor.check_now().await, ConnectionQuality::Excellent);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(h.engine.run_count(), 1);
    assert_eq!(h.state.snapshot().pending_operations_count, 0);
    h.engine.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_with_empty_queue_does_not_run() {
    let h = harness();
    let monitor = Arc::new(ConnectivityMonitor::new(
      h.transport.clone(),
      h.state.connectivity_writer(),
      h.clock.clone(),
      MonitorConfig::default(),
    ));
    h.engine.start(&monitor);
    h.transport.reply(HttpMethod::Get, "/api/health", 200, Value::Null);

    monitor.check_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    assert_eq!(h.engine.run_count(), 0);
    h.engine.stop();
  }

  #[tokio::test]
  async fn test_pause_blocks_runs_until_resume() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.engine.pause();
    assert_eq!(h.state.snapshot().sync_status, SyncStatus::Paused);

    h.set_quality(ConnectionQuality::Good);
    assert!(matches!(h.engine.process_queue().await, Err(SyncError::Paused)));

    h.engine.resume();
    assert_eq!(h.state.snapshot().sync_status, SyncStatus::Idle);
    h.transport.reply(HttpMethod::Post, "/api/patients", 201, Value::Null);
    // resume() may have spawned a run already; either way the queue drains
    let _ = h.engine.process_queue().await;
    tokio::task::yield_now().await;
    assert_eq!(h.transport.calls_to(HttpMethod::Post, "/api/patients"), 1);
  }

  #[tokio::test]
  async fn test_lease_held_by_another_client_blocks_run() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    let now = h.clock.now();
    h.cache
      .store()
      .put(
        partitions::METADATA,
        &CacheEntry::new(
          LEASE_ID,
          json!({"owner": "someone-else"}),
          now,
          Some(now + Duration::seconds(60)),
          EntrySource::Local,
        ),
      )
      .unwrap();
    h.set_quality(ConnectionQuality::Good);

    assert!(matches!(h.engine.process_queue().await, Err(SyncError::LeaseHeld)));
    assert!(!h.engine.is_processing());

    // The lease expires on its own
    h.clock.advance(Duration::seconds(61));
    h.transport.reply(HttpMethod::Post, "/api/patients", 201, Value::Null);
    let report = h.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(h.engine.lease_owner().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_retry_failed_requeues_with_fresh_budget() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.transport.reply(HttpMethod::Post, "/api/patients", 400, Value::Null);
    h.set_quality(ConnectionQuality::Good);
    h.engine.process_queue().await.unwrap();

    let failed = h.engine.failed_operations().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(!h.engine.retry_failed("missing").unwrap());

    h.set_quality(ConnectionQuality::Offline);
    assert!(h.engine.retry_failed(&failed[0].id).unwrap());
    let pending = h.engine.pending_operations().unwrap();
    assert_eq!(pending[0].attempts, 0);
    assert!(pending[0].error.is_none());
    assert_eq!(h.state.snapshot().pending_operations_count, 1);
    assert!(h.engine.failed_operations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_initialize_publishes_persisted_count() {
    let h = harness();
    h.engine.queue_operation(create_patient("temp_1")).unwrap();
    h.state.sync_writer().set_pending(0);

    assert_eq!(h.engine.initialize().unwrap(), 1);
    assert_eq!(h.state.snapshot().pending_operations_count, 1);
  }
}
