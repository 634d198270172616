//! Connectivity monitor: active probing, platform signals and listener fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::quality::{
  should_sync_now, should_use_cache, CacheMode, ConnectionQuality, QualityThresholds,
};
use crate::clock::{Clock, SharedClock};
use crate::net::{send_with_timeout, HttpRequest, HttpTransport};
use crate::state::{ConnectionState, ConnectivityWriter};

/// Probe settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
  /// Lightweight endpoint answering any 2xx when the backend is reachable
  pub health_url: String,
  pub probe_interval: Duration,
  pub probe_timeout: Duration,
  pub thresholds: QualityThresholds,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      health_url: "/api/health".to_string(),
      probe_interval: Duration::from_secs(30),
      probe_timeout: Duration::from_secs(5),
      thresholds: QualityThresholds::default(),
    }
  }
}

/// Online/offline notification from the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
  Online,
  Offline,
}

/// Delivered to listeners on every quality transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityChange {
  pub previous: ConnectionQuality,
  pub current: ConnectionQuality,
  pub state: ConnectionState,
}

impl ConnectivityChange {
  /// Below `Good` before, `Good` or better now.
  pub fn became_good(&self) -> bool {
    !self.previous.is_good() && self.current.is_good()
  }
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ConnectivityChange) + Send + Sync>;

/// Background task plus the channel feeding it platform signals.
struct Running {
  task: JoinHandle<()>,
  signals: mpsc::UnboundedSender<PlatformSignal>,
}

/// Tracks connection quality and tells interested components when it changes.
pub struct ConnectivityMonitor {
  transport: Arc<dyn HttpTransport>,
  writer: ConnectivityWriter,
  clock: SharedClock,
  config: MonitorConfig,
  listeners: Mutex<Vec<(ListenerId, Listener)>>,
  next_listener: AtomicU64,
  last_latency: Mutex<Option<Duration>>,
  running: Mutex<Option<Running>>,
}

impl ConnectivityMonitor {
  pub fn new(
    transport: Arc<dyn HttpTransport>,
    writer: ConnectivityWriter,
    clock: SharedClock,
    config: MonitorConfig,
  ) -> Self {
    Self {
      transport,
      writer,
      clock,
      config,
      listeners: Mutex::new(Vec::new()),
      next_listener: AtomicU64::new(1),
      last_latency: Mutex::new(None),
      running: Mutex::new(None),
    }
  }

  /// Probe once, then start the periodic loop. Calling again while the loop
  /// runs does nothing.
  pub async fn initialize(self: &Arc<Self>) -> ConnectionQuality {
    if self.is_running() {
      return self.quality();
    }

    let quality = self.check_now().await;

    let (tx, rx) = mpsc::unbounded_channel();
    let monitor = Arc::clone(self);
    let task = tokio::spawn(async move { monitor.run(rx).await });

    match self.running.lock() {
      Ok(mut running) => {
        if let Some(previous) = running.replace(Running { task, signals: tx }) {
          previous.task.abort();
        }
      }
      Err(_) => {
        error!("connectivity monitor lock poisoned, probe loop not started");
        task.abort();
      }
    }

    info!(?quality, "connectivity monitor started");
    quality
  }

  /// Stop the probe loop and stop accepting platform signals.
  pub fn destroy(&self) {
    let running = match self.running.lock() {
      Ok(mut running) => running.take(),
      Err(_) => None,
    };
    if let Some(running) = running {
      running.task.abort();
      debug!("connectivity monitor stopped");
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.lock().map(|r| r.is_some()).unwrap_or(false)
  }

  async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<PlatformSignal>) {
    let mut ticker = tokio::time::interval(self.config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // initialize() already probed
    ticker.tick().await;

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.check_now().await;
        }
        signal = signals.recv() => match signal {
          Some(signal) => self.handle_signal(signal).await,
          None => break,
        },
      }
    }
  }

  /// Deliver a platform signal to the running loop.
  ///
  /// Returns `false` when the monitor is not running.
  pub fn signal(&self, signal: PlatformSignal) -> bool {
    match self.running.lock() {
      Ok(running) => running
        .as_ref()
        .is_some_and(|r| r.signals.send(signal).is_ok()),
      Err(_) => false,
    }
  }

  /// React to a platform signal directly.
  pub async fn handle_signal(&self, signal: PlatformSignal) {
    debug!(?signal, "platform connectivity signal");
    match signal {
      PlatformSignal::Offline => self.apply(ConnectionQuality::Offline),
      PlatformSignal::Online => {
        self.check_now().await;
      }
    }
  }

  /// Probe and publish the result.
  pub async fn check_now(&self) -> ConnectionQuality {
    let quality = self.probe().await;
    self.apply(quality);
    quality
  }

  /// Measure round-trip time to the health endpoint. Any failure is offline.
  pub async fn probe(&self) -> ConnectionQuality {
    let request = HttpRequest::get(self.config.health_url.clone())
      .with_header("Cache-Control", "no-cache, no-store")
      .with_header("Pragma", "no-cache")
      .with_timeout(self.config.probe_timeout);

    let started = Instant::now();
    let result = send_with_timeout(self.transport.as_ref(), request).await;
    let latency = started.elapsed();

    let quality = match result {
      Ok(response) if response.is_success() => {
        self.set_last_latency(Some(latency));
        self.config.thresholds.classify(latency)
      }
      Ok(response) => {
        debug!(status = response.status, "health probe rejected");
        self.set_last_latency(None);
        ConnectionQuality::Offline
      }
      Err(e) => {
        debug!(error = %e, "health probe failed");
        self.set_last_latency(None);
        ConnectionQuality::Offline
      }
    };
    debug!(?quality, latency_ms = latency.as_millis() as u64, "health probe");
    quality
  }

  fn apply(&self, quality: ConnectionQuality) {
    let previous = self.writer.set_quality(quality, self.clock.now());
    if previous == quality {
      return;
    }

    info!(?previous, current = ?quality, "connection quality changed");
    let change = ConnectivityChange {
      previous,
      current: quality,
      state: self.writer.snapshot(),
    };
    self.notify(&change);
  }

  fn notify(&self, change: &ConnectivityChange) {
    // Snapshot so listeners may (un)subscribe from inside a callback
    let listeners: Vec<(ListenerId, Listener)> = match self.listeners.lock() {
      Ok(listeners) => listeners.clone(),
      Err(_) => return,
    };

    for (id, listener) in listeners {
      if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
        error!(listener = id, "connectivity listener panicked");
      }
    }
  }

  /// Register a callback for quality transitions.
  pub fn subscribe<F>(&self, listener: F) -> ListenerId
  where
    F: Fn(&ConnectivityChange) + Send + Sync + 'static,
  {
    let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
    match self.listeners.lock() {
      Ok(mut listeners) => listeners.push((id, Arc::new(listener))),
      Err(_) => warn!("connectivity listener registry poisoned"),
    }
    id
  }

  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    match self.listeners.lock() {
      Ok(mut listeners) => {
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
      }
      Err(_) => false,
    }
  }

  pub fn quality(&self) -> ConnectionQuality {
    self.writer.quality()
  }

  pub fn snapshot(&self) -> ConnectionState {
    self.writer.snapshot()
  }

  /// Latency of the last successful probe.
  pub fn last_latency(&self) -> Option<Duration> {
    self.last_latency.lock().ok().and_then(|l| *l)
  }

  fn set_last_latency(&self, latency: Option<Duration>) {
    if let Ok(mut last) = self.last_latency.lock() {
      *last = latency;
    }
  }

  pub fn should_use_cache(&self, mode: CacheMode) -> bool {
    should_use_cache(mode, self.quality())
  }

  pub fn should_sync_now(&self) -> bool {
    let state = self.snapshot();
    should_sync_now(state.connection_quality, state.sync_status)
  }
}
