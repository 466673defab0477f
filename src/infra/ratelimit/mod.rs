//! Retry rate limiters.
//!
//! A limiter turns the failure history of a key into the delay before its
//! next attempt. Limiters compose: [`MaxOfRateLimiter`] combines a global
//! budget with per-key backoff, [`WithMaxWait`] caps any limiter.

use std::time::Duration;

pub mod bucket;
pub mod composite;
pub mod exponential;
pub mod fast_slow;

pub use bucket::BucketRateLimiter;
pub use composite::{MaxOfRateLimiter, WithMaxWait};
pub use exponential::ExponentialFailureRateLimiter;
pub use fast_slow::FastSlowRateLimiter;

/// Decides how long a failed key waits before it is retried.
///
/// Implementations synchronize internally; callers hold no locks.
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure of `key` and return the delay before its next attempt.
    fn when(&self, key: &K) -> Duration;

    /// Reset the failure history of `key`.
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

impl<K, L> RateLimiter<K> for Box<L>
where
    L: RateLimiter<K> + ?Sized,
{
    fn when(&self, key: &K) -> Duration {
        (**self).when(key)
    }

    fn forget(&self, key: &K) {
        (**self).forget(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        (**self).num_requeues(key)
    }
}
