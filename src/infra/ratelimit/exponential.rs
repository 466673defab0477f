//! Per-key exponential backoff.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;

use super::RateLimiter;

/// Delay doubles with every failure of a key: `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K> {
    /// Create a limiter starting at `base` and never exceeding `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for a key that has already failed `failures` times.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        // 2^32 overflows the u32 multiplier; every such delay is past any sane max.
        if failures >= u32::BITS {
            return self.max;
        }
        self.base
            .checked_mul(1_u32 << failures)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl<K> RateLimiter<K> for ExponentialFailureRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let failures = {
            let mut map = self.failures.lock();
            let count = map.entry(key.clone()).or_insert(0);
            let previous = *count;
            *count = count.saturating_add(1);
            previous
        };
        self.backoff(failures)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
