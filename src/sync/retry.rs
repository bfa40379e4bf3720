use std::time::Duration;

/// How failed submissions are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Submission attempts for one entry within a single pass (at least 1)
  pub attempts_per_pass: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Consecutive failed passes before the entry is parked (0 = never)
  pub park_after: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts_per_pass: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
      park_after: 10,
    }
  }
}

impl RetryPolicy {
  /// Single attempt per pass, no waiting, never park.
  pub fn immediate() -> Self {
    Self {
      attempts_per_pass: 1,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      park_after: 0,
    }
  }

  /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
  /// capped at `max_delay`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    self
      .base_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay)
  }
}
