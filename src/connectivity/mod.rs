//! Connectivity monitoring.
//!
//! Quality is derived from the round-trip time of a periodic health probe,
//! overridden immediately by platform offline signals. Transitions are
//! published to the shared state and fanned out to registered listeners.

mod monitor;
mod quality;

pub use monitor::{
  ConnectivityChange, ConnectivityMonitor, ListenerId, MonitorConfig, PlatformSignal,
};
pub use quality::{should_sync_now, should_use_cache, CacheMode, ConnectionQuality, QualityThresholds};
