//! Exponential backoff schedule for transient external failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry policy: `max_retries` retries after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, for callers that must not block.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retrying after failed attempt number `attempt` (0-based).
    ///
    /// `base * 2^attempt` capped at `max_delay_ms`, plus `jitter` scaled into `[0, base)`.
    /// `jitter` is clamped into `[0, 1)`. Delays strictly increase until the cap is reached.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.999_999)
        } else {
            0.0
        };
        let jitter_ms = (self.base_delay_ms as f64 * jitter) as u64;
        Duration::from_millis(capped.saturating_add(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, 0.0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_millis(4_000));
    }

    /// Jitter stays below one base step, so the worst-case delay at attempt n is
    /// still shorter than the best-case delay at attempt n + 1.
    #[test]
    fn jitter_never_breaks_monotonic_growth() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 10_000,
        };
        for attempt in 0..5 {
            let worst = policy.delay_for(attempt, 1.0);
            let best_next = policy.delay_for(attempt + 1, 0.0);
            assert!(worst < best_next, "attempt {attempt}: {worst:?} >= {best_next:?}");
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 50,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        };
        assert_eq!(policy.delay_for(40, 0.0), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(u32::MAX, f64::NAN), Duration::from_millis(5_000));
    }

    #[test]
    fn max_attempts_counts_first_try() {
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }
}
