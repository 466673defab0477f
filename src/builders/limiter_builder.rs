//! Default retry limiter built from executor configuration.

use crate::config::ExecutorConfig;
use crate::core::JobKey;
use crate::infra::ratelimit::{BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter};

/// Burst of the global retry bucket, in seconds' worth of refill.
pub const BUCKET_BURST_SECONDS: u32 = 10;

/// Build the executor's retry limiter.
///
/// Combines per-job exponential backoff (`base_retry_delay` doubling up to
/// `max_retry_delay`) with a global token bucket refilling at
/// `per_worker_qps * worker_count` retries per second.
#[must_use]
pub fn build_rate_limiter(cfg: &ExecutorConfig) -> MaxOfRateLimiter<JobKey> {
    let workers = u32::try_from(cfg.worker_count).unwrap_or(u32::MAX);
    let rate = cfg.per_worker_qps.saturating_mul(workers);
    let burst = rate.saturating_mul(BUCKET_BURST_SECONDS);

    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            cfg.base_retry_delay,
            cfg.max_retry_delay,
        )),
        Box::new(BucketRateLimiter::new(f64::from(rate), burst)),
    ])
}
