use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::{partitions, SqliteStore};
use crate::connectivity::{CacheMode, MonitorConfig, QualityThresholds};
use crate::sync::{ConflictStrategy, RetryPolicy, SyncConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("config file not found: {}", .0.display())]
  NotFound(PathBuf),

  #[error("failed to read config file {}: {source}", path.display())]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("failed to parse config file {}: {source}", path.display())]
  Parse {
    path: PathBuf,
    source: serde_yaml::Error,
  },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

/// Engine configuration. Every field has a default so an empty or missing
/// file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub connectivity: ConnectivityConfig,
  pub sync: SyncSettings,
  /// Read-source preference at startup
  pub mode: CacheMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Relative endpoints are resolved against this URL
  pub base_url: Option<String>,
  pub health_path: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      health_path: "/api/health".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file; defaults to the user data directory
  pub path: Option<PathBuf>,
  /// Domain partitions, one per entity type
  pub partitions: Vec<String>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      partitions: vec![
        partitions::PATIENTS.to_string(),
        partitions::DRUGS.to_string(),
        partitions::OPERATIONS.to_string(),
      ],
    }
  }
}

impl StorageConfig {
  pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
    match &self.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStore::default_path().ok_or_else(|| {
        ConfigError::Invalid("no data directory available, set storage.path".to_string())
      }),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Zero keeps entries until invalidated
  pub default_ttl_secs: u64,
  pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 24 * 60 * 60,
      cleanup_interval_secs: 2 * 60 * 60,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Option<Duration> {
    match self.default_ttl_secs {
      0 => None,
      secs => Some(Duration::seconds(secs as i64)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
  pub thresholds: QualityThresholds,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
      probe_timeout_secs: 5,
      thresholds: QualityThresholds::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  pub batch_size: usize,
  pub request_timeout_secs: u64,
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub sweep_interval_secs: u64,
  pub lease_ttl_secs: u64,
  pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      batch_size: 10,
      request_timeout_secs: 30,
      max_attempts: 5,
      base_delay_ms: 1000,
      max_delay_ms: 5 * 60 * 1000,
      sweep_interval_secs: 5 * 60,
      lease_ttl_secs: 120,
      conflict_strategy: ConflictStrategy::LastWriteWins,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// With no explicit path and no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = match explicit_path {
      Some(p) if p.exists() => Some(p.to_path_buf()),
      Some(p) => return Err(ConfigError::NotFound(p.to_path_buf())),
      None => Self::find_config_file(),
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    // An empty file parses as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }

    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let invalid =
      |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

    if let Some(base) = &self.server.base_url {
      if let Err(e) = url::Url::parse(base) {
        return Err(ConfigError::Invalid(format!(
          "server.base_url '{}': {}",
          base, e
        )));
      }
    }
    if let Some(reserved) = self
      .storage
      .partitions
      .iter()
      .find(|p| partitions::RESERVED.contains(&p.as_str()))
    {
      return Err(ConfigError::Invalid(format!(
        "storage.partitions may not include reserved partition '{}'",
        reserved
      )));
    }

    let t = &self.connectivity.thresholds;
    if !(t.excellent_ms < t.good_ms && t.good_ms < t.poor_ms) {
      return invalid("connectivity.thresholds must be strictly increasing");
    }
    if self.connectivity.probe_interval_secs == 0 || self.connectivity.probe_timeout_secs == 0 {
      return invalid("connectivity intervals must be positive");
    }
    if self.cache.cleanup_interval_secs == 0 {
      return invalid("cache.cleanup_interval_secs must be positive");
    }

    let s = &self.sync;
    if s.batch_size == 0 || s.max_attempts == 0 {
      return invalid("sync.batch_size and sync.max_attempts must be positive");
    }
    if s.base_delay_ms > s.max_delay_ms {
      return invalid("sync.base_delay_ms must not exceed sync.max_delay_ms");
    }
    if s.request_timeout_secs == 0 || s.sweep_interval_secs == 0 || s.lease_ttl_secs == 0 {
      return invalid("sync timeouts and intervals must be positive");
    }
    Ok(())
  }

  pub fn monitor_config(&self) -> MonitorConfig {
    MonitorConfig {
      health_url: self.server.health_path.clone(),
      probe_interval: std::time::Duration::from_secs(self.connectivity.probe_interval_secs),
      probe_timeout: std::time::Duration::from_secs(self.connectivity.probe_timeout_secs),
      thresholds: self.connectivity.thresholds,
    }
  }

  pub fn sync_config(&self) -> SyncConfig {
    let s = &self.sync;
    SyncConfig {
      batch_size: s.batch_size,
      request_timeout: std::time::Duration::from_secs(s.request_timeout_secs),
      max_attempts: s.max_attempts,
      retry: RetryPolicy::new(
        Duration::milliseconds(s.base_delay_ms as i64),
        Duration::milliseconds(s.max_delay_ms as i64),
      ),
      sweep_interval: std::time::Duration::from_secs(s.sweep_interval_secs),
      lease_ttl: Duration::seconds(s.lease_ttl_secs as i64),
      conflict_strategy: s.conflict_strategy,
    }
  }

  pub fn cleanup_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.cache.cleanup_interval_secs)
  }
}
