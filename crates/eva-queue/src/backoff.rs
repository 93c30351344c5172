use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry delay policy for failed queue items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap for the exponential growth, in milliseconds.
    pub max_delay_ms: u64,
    /// Fractional jitter applied symmetrically, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// `min(max_delay, base_delay * 2^(n-1))` for the n-th retry, before jitter.
    pub fn nominal_delay_ms(&self, retry: u32) -> u64 {
        let exponent = retry.saturating_sub(1);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        delay.min(self.max_delay_ms)
    }

    /// Jittered delay for the n-th retry.
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let nominal = self.nominal_delay_ms(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal == 0 {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        (nominal as f64 * factor).round().max(0.0) as u64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = BackoffPolicy {
            base_delay_ms: 500,
            max_delay_ms: 1_000_000,
            jitter: 0.0,
        };
        assert_eq!(policy.nominal_delay_ms(1), 500);
        assert_eq!(policy.nominal_delay_ms(2), 1_000);
        assert_eq!(policy.nominal_delay_ms(3), 2_000);
        assert_eq!(policy.nominal_delay_ms(4), 4_000);
        assert_eq!(policy.delay_ms(4), 4_000);
    }

    #[test]
    fn test_capped_at_max() {
        let policy = BackoffPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter: 0.0,
        };
        assert_eq!(policy.nominal_delay_ms(10), 5_000);
        assert_eq!(policy.nominal_delay_ms(200), 5_000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for retry in 1..=6 {
            let nominal = policy.nominal_delay_ms(retry) as f64;
            for _ in 0..100 {
                let d = policy.delay_ms(retry) as f64;
                assert!(d >= (nominal * 0.8).floor(), "{d} below bound for {nominal}");
                assert!(d <= (nominal * 1.2).ceil(), "{d} above bound for {nominal}");
            }
        }
    }

    #[test]
    fn test_zero_retry_treated_as_first() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.nominal_delay_ms(0), policy.nominal_delay_ms(1));
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: BackoffPolicy = toml::from_str("base_delay_ms = 250").unwrap();
        assert_eq!(policy.base_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, 300_000);
    }
}
