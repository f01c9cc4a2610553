//! Append rate limiting for chatseq-server.
//!
//! Appends are limited per user and globally. The sync endpoint and broker
//! subscriptions are never limited: recovery traffic must always get through.
//!
//! Both limiters use governor; the per-user one is keyed by the 16 UUID bytes
//! of the caller and backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use seq_types::UserId;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Append rate limiters.
#[derive(Clone)]
pub struct RateLimits {
    user_limiter: Arc<KeyedLimiter<[u8; 16]>>,
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("user_limiter", &"KeyedLimiter<[u8;16]>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are rejected by [`crate::config::Config::validate`]; if one
    /// slips through it is treated as a quota of one.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_user = NonZeroU32::new(config.appends_per_minute).unwrap_or(NonZeroU32::MIN);
        let global = NonZeroU32::new(config.global_appends_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            user_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_user))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(global))),
        }
    }

    /// Check whether `user` may append now.
    ///
    /// The per-user quota is checked first so a throttled user does not
    /// spend global tokens.
    pub fn check_append(&self, user: &UserId) -> Result<(), RateLimitError> {
        self.user_limiter
            .check_key(user.as_uuid().as_bytes())
            .map_err(|_| RateLimitError::UserLimitExceeded)?;
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked user keys (for metrics).
    pub fn user_keys_count(&self) -> usize {
        self.user_limiter.len()
    }

    /// Evict fully recharged entries. Called from the sweeper.
    pub fn shrink(&self) {
        self.user_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many appends from this user.
    #[error("append rate limit exceeded")]
    UserLimitExceeded,
    /// Server-wide append rate exceeded.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
