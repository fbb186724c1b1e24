use std::time::Duration;

use chrono::{DateTime, Utc};

/// Capped exponential backoff: `min(base_delay * 2^attempt, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before the retry following `attempt` prior attempts (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(32));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis().min(u64::MAX as u128) as u64);
        Duration::from_millis(capped_ms)
    }

    /// When the retry following `attempt` prior attempts becomes due.
    ///
    /// A delay past the representable range clamps to the latest instant, so
    /// an overflowing policy never retries early.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
