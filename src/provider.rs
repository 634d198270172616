//! Wires the store, cache, monitor, sync engine and façade together and owns
//! their background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheManager, SqliteStore, Store, StoreError, StoreResult};
use crate::client::OfflineClient;
use crate::clock::SharedClock;
use crate::config::{Config, ConfigError};
use crate::connectivity::{CacheMode, ConnectionQuality, ConnectivityMonitor, PlatformSignal};
use crate::net::HttpTransport;
use crate::state::{ConnectionState, SharedState};
use crate::sync::{SyncEngine, SyncError, SyncReport, SyncResult};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
  /// Storage could not be opened. Retrying, or resetting storage and
  /// retrying, are the only ways forward.
  #[error("offline storage unavailable: {0}")]
  Initialization(#[source] StoreError),

  #[error(transparent)]
  Config(#[from] ConfigError),
}

pub struct Provider {
  state: SharedState,
  cache: Arc<CacheManager>,
  monitor: Arc<ConnectivityMonitor>,
  engine: Arc<SyncEngine>,
  client: Arc<OfflineClient>,
  cleanup: Mutex<Option<JoinHandle<()>>>,
  stopped: AtomicBool,
}

impl Provider {
  /// Open the configured store and start every component.
  pub async fn start(
    config: Config,
    transport: Arc<dyn HttpTransport>,
    clock: SharedClock,
  ) -> Result<Arc<Self>, ProviderError> {
    config.validate()?;
    let path = config.storage.resolved_path()?;
    let store = SqliteStore::open(&path, config.storage.partitions.clone(), clock.clone())
      .map_err(ProviderError::Initialization)?;
    info!(path = %path.display(), "opened offline store");
    Self::start_with_store(config, Arc::new(store), transport, clock).await
  }

  /// Start every component on an already opened store.
  pub async fn start_with_store(
    config: Config,
    store: Arc<dyn Store>,
    transport: Arc<dyn HttpTransport>,
    clock: SharedClock,
  ) -> Result<Arc<Self>, ProviderError> {
    store.initialize().map_err(ProviderError::Initialization)?;

    let state = SharedState::new();
    let cache = Arc::new(
      CacheManager::new(store, clock.clone()).with_default_ttl(config.cache.default_ttl()),
    );
    let monitor = Arc::new(ConnectivityMonitor::new(
      transport.clone(),
      state.connectivity_writer(),
      clock.clone(),
      config.monitor_config(),
    ));
    let engine = Arc::new(SyncEngine::new(
      cache.clone(),
      transport.clone(),
      state.sync_writer(),
      clock,
      config.sync_config(),
    ));
    let client = Arc::new(OfflineClient::new(
      cache.clone(),
      monitor.clone(),
      engine.clone(),
      transport,
      config.mode,
      config.sync_config().request_timeout,
    ));

    match engine.initialize() {
      Ok(_) => {}
      Err(SyncError::Store(e)) => return Err(ProviderError::Initialization(e)),
      Err(e) => warn!(error = %e, "could not load pending operations"),
    }

    // Subscribe before the first probe so starting online drains the queue
    engine.start(&monitor);
    let cleanup = cache.spawn_cleanup(config.cleanup_interval());
    let quality = monitor.initialize().await;
    info!(?quality, mode = ?config.mode, "offline provider started");

    Ok(Arc::new(Self {
      state,
      cache,
      monitor,
      engine,
      client,
      cleanup: Mutex::new(Some(cleanup)),
      stopped: AtomicBool::new(false),
    }))
  }

  /// Delete the store file so the next start recreates it.
  pub fn reset_storage(config: &Config) -> Result<(), ProviderError> {
    let path = config.storage.resolved_path()?;
    SqliteStore::destroy(&path).map_err(ProviderError::Initialization)
  }

  /// Subscribe to connection and sync state.
  pub fn state(&self) -> watch::Receiver<ConnectionState> {
    self.state.subscribe()
  }

  pub fn snapshot(&self) -> ConnectionState {
    self.state.snapshot()
  }

  pub fn client(&self) -> Arc<OfflineClient> {
    Arc::clone(&self.client)
  }

  pub fn cache(&self) -> &Arc<CacheManager> {
    &self.cache
  }

  pub fn engine(&self) -> &Arc<SyncEngine> {
    &self.engine
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  /// Probe now instead of waiting for the next interval.
  pub async fn refresh_connection(&self) -> ConnectionQuality {
    self.monitor.check_now().await
  }

  /// Forward a platform online/offline notification.
  pub fn platform_signal(&self, signal: PlatformSignal) -> bool {
    self.monitor.signal(signal)
  }

  /// Replay the queue now. Fails when a run is already in progress or the
  /// connection is not good enough.
  pub async fn force_sync(&self) -> SyncResult<SyncReport> {
    self.engine.process_queue().await
  }

  /// Clear one partition, or every domain partition when `store` is `None`.
  /// Queued operations are kept.
  pub fn clear_cache(&self, store: Option<&str>) -> StoreResult<()> {
    match store {
      Some(store) => {
        self.cache.invalidate(store, None)?;
        info!(store, "cleared cache partition");
        Ok(())
      }
      None => self.cache.clear_all(),
    }
  }

  pub fn set_mode(&self, mode: CacheMode) {
    self.client.set_mode(mode);
  }

  pub fn mode(&self) -> CacheMode {
    self.client.mode()
  }

  /// Stop background work. Safe to call more than once.
  pub fn shutdown(&self) {
    if self.stopped.swap(true, Ordering::SeqCst) {
      return;
    }
    self.engine.stop();
    self.monitor.destroy();
    if let Some(task) = self.cleanup.lock().ok().and_then(|mut c| c.take()) {
      task.abort();
    }
    info!("offline provider stopped");
  }
}

impl Drop for Provider {
  fn drop(&mut self) {
    self.shutdown();
  }
}
