//! Retry policy for node dispatches
//!
//! Exponential backoff with a cap and full jitter. The default budget is
//! three attempts at 1s → 2s → 4s, matching what the built-in node types
//! expect from transient upstream failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Ceiling on the computed delay.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier between retries.
    pub backoff_coefficient: f64,

    /// Jitter factor in `0.0..=1.0`. With full jitter (1.0) the actual
    /// delay is drawn uniformly from `(0, computed]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
            backoff_coefficient: 2.0,
            jitter: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether the attempt that just failed leaves budget for another.
    pub fn has_attempts_remaining(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.max_attempts
    }

    /// Delay to wait before `attempt` (1-based; the first attempt has no
    /// delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let scale = 1.0 - self.jitter * rng.gen_range(0.0..1.0);
            Duration::from_secs_f64((capped * scale).max(0.0))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_without_jitter() {
        let policy = RetryPolicy::default().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
        // Capped past the max interval.
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(4));
    }

    #[test]
    fn test_full_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(3);
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));

        assert!(!RetryPolicy::none().has_attempts_remaining(1));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::default().with_max_attempts(5);
        let raw = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&raw).unwrap();
        assert_eq!(policy, parsed);
    }
}
