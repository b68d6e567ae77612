//! Reconnect backoff policy.
//!
//! Exponential growth from a base delay up to a cap, with jitter applied
//! downwards only. With `jitter < 0.5` a jittered delay never drops below
//! half its nominal value, so consecutive delays below the cap still grow
//! strictly.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with cap, jitter, and an attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_ms: u64,
    /// Upper bound for any single delay.
    pub cap_ms: u64,
    /// Fraction of the nominal delay that may be shaved off, in `[0, 0.5)`.
    pub jitter: f64,
    /// Failed attempts allowed before the connection moves to `Error`.
    /// Zero means retry forever.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            jitter: 0.2,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let shave: f64 = rand::rng().random_range(0.0..self.jitter);
        nominal.mul_f64(1.0 - shave)
    }

    /// Whether `failed_attempts` consecutive failures exhaust the budget.
    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts > 0 && failed_attempts >= self.max_attempts
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 100,
            cap_ms: 800,
            jitter,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_nominal_delay_doubles_up_to_cap() {
        let p = policy(0.0);
        let delays: Vec<u64> = (1..=6).map(|a| p.nominal_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800, 800]);
    }

    #[test]
    fn test_cap_boundary() {
        let p = policy(0.0);
        // Attempt 4 reaches the cap exactly; attempt 5 (cap+1) stays on it.
        assert_eq!(p.nominal_delay(4), Duration::from_millis(800));
        assert_eq!(p.nominal_delay(5), Duration::from_millis(800));
    }

    #[test]
    fn test_jittered_delays_strictly_increase_below_cap() {
        let p = policy(0.49);
        for _ in 0..200 {
            let mut previous = Duration::ZERO;
            for attempt in 1..=4 {
                let d = p.delay(attempt);
                assert!(d > previous, "attempt {attempt}: {d:?} <= {previous:?}");
                assert!(d <= p.nominal_delay(attempt));
                previous = d;
            }
        }
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let p = BackoffPolicy {
            base_ms: u64::MAX / 2,
            cap_ms: u64::MAX,
            jitter: 0.0,
            max_attempts: 0,
        };
        assert_eq!(p.nominal_delay(500), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy(0.0);
        assert!(!p.exhausted(4));
        assert!(p.exhausted(5));
        let forever = BackoffPolicy {
            max_attempts: 0,
            ..policy(0.0)
        };
        assert!(!forever.exhausted(1_000));
    }
}
