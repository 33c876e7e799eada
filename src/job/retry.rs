//! Exponential backoff for failed jobs.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Default backoff base.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Delays are capped here so the timestamp arithmetic cannot overflow.
const MAX_DELAY_SECS: u64 = i32::MAX as u64;

/// Backoff policy: `delay = backoff_base ^ attempts` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub backoff_base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE)
    }
}

impl RetryPolicy {
    pub fn new(backoff_base: u32) -> Self {
        Self { backoff_base }
    }

    /// Delay in seconds after the `attempts`-th failure (saturating).
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        u64::from(self.backoff_base)
            .saturating_pow(attempts)
            .min(MAX_DELAY_SECS)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        Duration::from_secs(self.delay_secs(attempts))
    }

    /// When a job that just failed for the `attempts`-th time becomes claimable.
    pub fn retry_at(&self, failed_at: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        // delay_secs is capped well inside TimeDelta's range
        let delta = TimeDelta::try_seconds(self.delay_secs(attempts) as i64)
            .unwrap_or(TimeDelta::MAX);
        failed_at
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_base_to_the_attempts() {
        let policy = RetryPolicy::new(2);
        assert_eq!(policy.delay_secs(0), 1);
        assert_eq!(policy.delay_secs(1), 2);
        assert_eq!(policy.delay_secs(2), 4);
        assert_eq!(policy.delay_secs(3), 8);
        assert_eq!(policy.delay(3), Duration::from_secs(8));

        let policy = RetryPolicy::new(3);
        assert_eq!(policy.delay_secs(4), 81);
    }

    #[test]
    fn delay_is_strictly_increasing_for_base_above_one() {
        for base in 2..6 {
            let policy = RetryPolicy::new(base);
            for attempts in 0..10 {
                assert!(policy.delay_secs(attempts + 1) > policy.delay_secs(attempts));
            }
        }
    }

    #[test]
    fn base_one_is_constant() {
        let policy = RetryPolicy::new(1);
        assert_eq!(policy.delay_secs(0), policy.delay_secs(7));
    }

    #[test]
    fn huge_exponent_saturates() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.delay_secs(200), MAX_DELAY_SECS);
        let now = Utc::now();
        assert!(policy.retry_at(now, 200) > now);
    }

    #[test]
    fn retry_at_adds_delay() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.retry_at(now, 1), now + TimeDelta::seconds(2));
    }
}
