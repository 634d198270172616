//! Exponential retry delays.

use chrono::Duration;

/// `delay = min(base * 2^(attempts - 1), max_delay)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::seconds(1),
      max_delay: Duration::minutes(5),
    }
  }
}

impl RetryPolicy {
  pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      base_delay,
      max_delay,
    }
  }

  /// Delay before the next attempt, given attempts made so far (>= 1).
  pub fn delay_for(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    let factor = 1i32 << exponent;
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_doubles_then_caps() {
    let policy = RetryPolicy::new(Duration::seconds(1), Duration::seconds(10));
    let delays: Vec<i64> = (1..=6).map(|a| policy.delay_for(a).num_seconds()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
  }

  #[test]
  fn test_huge_attempt_counts_do_not_overflow() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    assert_eq!(policy.delay_for(0), policy.base_delay);
  }
}
