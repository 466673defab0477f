//! Global token-bucket limiter.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::RateLimiter;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every key.
///
/// Each call to `when` reserves one token; once the burst is spent the
/// returned delay is the time until the reserved token is refilled.
/// Failure counts are not tracked, so `num_requeues` is always zero.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second holding at most `burst`.
    ///
    /// A non-positive rate is raised to the smallest positive value.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub const fn qps(&self) -> f64 {
        self.qps
    }

    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.qps, bucket.tokens).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_free_then_delays_grow() {
        let limiter = BucketRateLimiter::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        }

        let fourth = RateLimiter::<&str>::when(&limiter, &"b");
        let fifth = RateLimiter::<&str>::when(&limiter, &"c");
        assert!(fourth > Duration::from_millis(50) && fourth <= Duration::from_millis(100));
        assert!(fifth > fourth);
        assert!(fifth <= Duration::from_millis(200));
    }

    #[test]
    fn test_requeues_are_not_tracked() {
        let limiter = BucketRateLimiter::new(1.0, 1);
        RateLimiter::<&str>::when(&limiter, &"a");
        RateLimiter::<&str>::when(&limiter, &"a");
        assert_eq!(RateLimiter::<&str>::num_requeues(&limiter, &"a"), 0);
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = BucketRateLimiter::new(100.0, 1);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::ZERO);
    }
}
