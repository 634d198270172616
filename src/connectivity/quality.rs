//! Connection quality classification and the cache/sync policies built on it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::SyncStatus;

/// Coarse network health, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionQuality {
  Offline,
  Poor,
  Good,
  Excellent,
}

impl ConnectionQuality {
  pub fn is_online(self) -> bool {
    self != Self::Offline
  }

  /// Good enough to replay queued writes.
  pub fn is_good(self) -> bool {
    self >= Self::Good
  }
}

/// Upper latency bounds (exclusive) for each online quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
  pub excellent_ms: u64,
  pub good_ms: u64,
  pub poor_ms: u64,
}

impl Default for QualityThresholds {
  fn default() -> Self {
    Self {
      excellent_ms: 100,
      good_ms: 300,
      poor_ms: 1000,
    }
  }
}

impl QualityThresholds {
  pub fn classify(&self, latency: Duration) -> ConnectionQuality {
    let ms = latency.as_millis();
    if ms < u128::from(self.excellent_ms) {
      ConnectionQuality::Excellent
    } else if ms < u128::from(self.good_ms) {
      ConnectionQuality::Good
    } else if ms < u128::from(self.poor_ms) {
      ConnectionQuality::Poor
    } else {
      ConnectionQuality::Offline
    }
  }
}

/// Read-source preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
  /// Serve from cache whenever there is a hit
  #[default]
  CacheFirst,
  /// Go to the network unless the connection is poor or down
  OnlineFirst,
  /// Never leave the device for reads
  FullOffline,
}

impl std::str::FromStr for CacheMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace('-', "_").as_str() {
      "cache_first" => Ok(Self::CacheFirst),
      "online_first" => Ok(Self::OnlineFirst),
      "full_offline" => Ok(Self::FullOffline),
      other => Err(format!(
        "unknown mode '{}', expected cache_first, online_first or full_offline",
        other
      )),
    }
  }
}

/// Whether a read should try the cache before the network.
pub fn should_use_cache(mode: CacheMode, quality: ConnectionQuality) -> bool {
  match mode {
    CacheMode::FullOffline | CacheMode::CacheFirst => true,
    CacheMode::OnlineFirst => quality <= ConnectionQuality::Poor,
  }
}

/// Whether queued writes should be replayed right now.
pub fn should_sync_now(quality: ConnectionQuality, status: SyncStatus) -> bool {
  quality.is_good() && status.is_idle()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_boundaries() {
    let t = QualityThresholds::default();
    assert_eq!(t.classify(Duration::from_millis(0)), ConnectionQuality::Excellent);
    assert_eq!(t.classify(Duration::from_millis(99)), ConnectionQuality::Excellent);
    assert_eq!(t.classify(Duration::from_millis(100)), ConnectionQuality::Good);
    assert_eq!(t.classify(Duration::from_millis(299)), ConnectionQuality::Good);
    assert_eq!(t.classify(Duration::from_millis(300)), ConnectionQuality::Poor);
    assert_eq!(t.classify(Duration::from_millis(999)), ConnectionQuality::Poor);
    assert_eq!(t.classify(Duration::from_millis(1000)), ConnectionQuality::Offline);
  }

  #[test]
  fn test_quality_ordering() {
    assert!(ConnectionQuality::Offline < ConnectionQuality::Poor);
    assert!(ConnectionQuality::Poor < ConnectionQuality::Good);
    assert!(ConnectionQuality::Good < ConnectionQuality::Excellent);
    assert!(!ConnectionQuality::Poor.is_good());
    assert!(ConnectionQuality::Poor.is_online());
  }

  #[test]
  fn test_should_use_cache_policy() {
    use ConnectionQuality::*;
    for q in [Offline, Poor, Good, Excellent] {
      assert!(should_use_cache(CacheMode::FullOffline, q));
      assert!(should_use_cache(CacheMode::CacheFirst, q));
    }
    assert!(should_use_cache(CacheMode::OnlineFirst, Offline));
    assert!(should_use_cache(CacheMode::OnlineFirst, Poor));
    assert!(!should_use_cache(CacheMode::OnlineFirst, Good));
    assert!(!should_use_cache(CacheMode::OnlineFirst, Excellent));
  }

  #[test]
  fn test_should_sync_now_policy() {
    assert!(should_sync_now(ConnectionQuality::Good, SyncStatus::Idle));
    assert!(should_sync_now(ConnectionQuality::Excellent, SyncStatus::Success));
    assert!(!should_sync_now(ConnectionQuality::Poor, SyncStatus::Idle));
    assert!(!should_sync_now(ConnectionQuality::Good, SyncStatus::Syncing));
    assert!(!should_sync_now(ConnectionQuality::Excellent, SyncStatus::Paused));
  }

  #[test]
  fn test_mode_parsing() {
    assert_eq!("online-first".parse::<CacheMode>(), Ok(CacheMode::OnlineFirst));
    assert_eq!("FULL_OFFLINE".parse::<CacheMode>(), Ok(CacheMode::FullOffline));
    assert!("sometimes".parse::<CacheMode>().is_err());
  }
}
