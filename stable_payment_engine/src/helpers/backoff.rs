//! Retry backoff for outbox dispatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Exponential backoff with jitter: `min(cap, base * 2^attempt) * uniform(0.5, 1.5)`.
///
/// `attempt` counts completed attempts, so the delay after the first failure
/// is roughly `base`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(5), cap: Duration::from_secs(3600), max_attempts: 12 }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts }
    }

    /// True once `attempts` completed attempts have exhausted the budget;
    /// the row should be marked Dead rather than retried.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// The jittered delay to wait after `attempt` completed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(40));
        let capped = exp.min(self.cap.as_millis()) as u64;
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((capped as f64 * jitter) as u64)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(self.delay(attempt).as_millis() as i64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 0..12 {
            let raw = (5_000u64 << attempt).min(3_600_000);
            for _ in 0..20 {
                let d = policy.delay(attempt).as_millis() as u64;
                assert!(d >= raw / 2, "attempt {attempt}: {d} below jitter floor");
                assert!(d <= raw + raw / 2, "attempt {attempt}: {d} above jitter ceiling");
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();
        // Far past the point where 5s * 2^n exceeds the cap.
        let d = policy.delay(40);
        assert!(d <= Duration::from_millis(3_600_000 * 3 / 2));
    }

    #[test]
    fn attempts_budget() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(11));
        assert!(policy.is_exhausted(12));
    }
}
