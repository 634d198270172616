//! Wall-clock abstraction.
//!
//! Expiry checks and retry scheduling read time through a [`Clock`] so they
//! can be driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  /// Move the clock forward.
  pub fn advance(&self, by: Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }

  pub fn set(&self, at: DateTime<Utc>) {
    if let Ok(mut now) = self.now.lock() {
      *now = at;
    }
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    match self.now.lock() {
      Ok(now) => *now,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;
