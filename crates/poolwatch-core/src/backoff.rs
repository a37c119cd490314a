//! Exponential backoff with full jitter.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Backoff parameters shared by chain reads and alert delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Ceiling of the first retry delay (ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of any retry delay (ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay ceiling for a 1-based attempt: `base * 2^(attempt-1)`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Full-jitter delay: uniform in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rand_below(ceiling.saturating_add(1)))
    }
}

/// Cheap pseudo-random value in `[0, bound)`.
///
/// Mixes wall-clock nanos with a process-wide counter through splitmix64 so
/// back-to-back calls differ.
fn rand_below(bound: u64) -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if bound <= 1 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut z = nanos
        .wrapping_add(COUNTER.fetch_add(1, Ordering::Relaxed))
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    z % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let backoff = BackoffConfig::new(1_000, 60_000);
        assert_eq!(backoff.ceiling(1), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(6), Duration::from_secs(32));
        assert_eq!(backoff.ceiling(7), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(1_000), Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let backoff = BackoffConfig::new(500, 10_000);
        assert_eq!(backoff.ceiling(0), backoff.ceiling(1));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let backoff = BackoffConfig::new(100, 1_000);
        for attempt in 1..20 {
            assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
        }
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let backoff = BackoffConfig::new(0, 0);
        assert_eq!(backoff.delay(5), Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.base_delay_ms, 1_000);
        assert_eq!(backoff.max_delay_ms, 60_000);
    }
}
