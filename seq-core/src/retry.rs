//! Retry policy for reconnects and fallback page fetches.
//!
//! Delays grow exponentially from `initial_delay`, are capped at `max_delay`,
//! and then pass through a jitter function so that many clients recovering
//! from the same outage do not reconnect in lockstep.
//!
//! The policy is a plain value: tests substitute [`no_jitter`] and drive the
//! timers with a paused clock.

use std::time::Duration;

/// Jitter applied to a capped delay. Must never return more than its input.
pub type JitterFn = fn(Duration) -> Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Bound on one connect + subscribe cycle, and on each fallback page fetch.
    pub attempt_timeout: Duration,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Jitter applied to the capped delay.
    pub jitter: JitterFn,
}

impl RetryPolicy {
    /// Doubling factor cap: 2^16 × initial is far past any sane `max_delay`.
    const MAX_EXPONENT: u32 = 16;

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(Self::MAX_EXPONENT);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.jitter)(self.base_delay(attempt))
    }

    /// Whether `attempt` consecutive failures exhaust this policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Same policy with jitter disabled.
    pub fn without_jitter(self) -> Self {
        Self {
            jitter: no_jitter,
            ..self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            attempt_timeout: Duration::from_secs(10),
            max_attempts: None,
            jitter: equal_jitter,
        }
    }
}

/// Half the delay, plus a random share of the other half.
pub fn equal_jitter(delay: Duration) -> Duration {
    let half = delay / 2;
    let spread = half.as_millis() as u64;
    if spread == 0 {
        return delay;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return delay;
    }
    let random = u64::from_le_bytes(bytes) % (spread + 1);
    half + Duration::from_millis(random)
}

/// Identity jitter for deterministic tests.
pub fn no_jitter(delay: Duration) -> Duration {
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default().without_jitter()
    }

    #[test]
    fn first_retry_uses_initial_delay() {
        assert_eq!(policy().delay_for(1), Duration::from_millis(500));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(7), Duration::from_secs(20));
        assert_eq!(p.delay_for(50), Duration::from_secs(20));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(20));
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        assert_eq!(policy().base_delay(0), policy().base_delay(1));
    }

    #[test]
    fn equal_jitter_stays_within_bounds() {
        let base = Duration::from_secs(8);
        for _ in 0..100 {
            let d = equal_jitter(base);
            assert!(d >= Duration::from_secs(4), "too short: {d:?}");
            assert!(d <= base, "too long: {d:?}");
        }
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let p = RetryPolicy::default();
        for attempt in 1..20 {
            assert!(p.delay_for(attempt) <= p.max_delay);
        }
    }

    #[test]
    fn equal_jitter_tiny_delay() {
        assert_eq!(equal_jitter(Duration::from_millis(1)), Duration::from_millis(1));
        assert_eq!(equal_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn unlimited_policy_never_exhausts() {
        assert!(!policy().is_exhausted(u32::MAX));
    }

    #[test]
    fn bounded_policy_exhausts_at_max() {
        let p = RetryPolicy {
            max_attempts: Some(3),
            ..policy()
        };
        assert!(!p.is_exhausted(2));
        assert!(p.is_exhausted(3));
    }
}
