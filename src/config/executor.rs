//! Executor configuration: defaults, builder methods, validation and loading.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix of environment variables read by [`ExecutorConfig::from_env`].
pub const ENV_PREFIX: &str = "ACTION_EXECUTOR_";

/// Smallest accepted worker thread stack.
pub const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Longest accepted job deadline or shutdown budget.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Worker pool configuration.
///
/// Durations are (de)serialized as integer milliseconds under `*_ms` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of queued plus running jobs.
    pub queue_capacity: usize,
    /// Number of worker threads.
    pub worker_count: usize,
    /// Requeues allowed for a failing job before it is abandoned.
    pub max_job_retries: u32,
    /// Delay before the first retry; doubles with every further failure.
    #[serde(rename = "base_retry_delay_ms", with = "duration_ms")]
    pub base_retry_delay: Duration,
    /// Upper bound on the per-job retry delay.
    #[serde(rename = "max_retry_delay_ms", with = "duration_ms")]
    pub max_retry_delay: Duration,
    /// Whether failed or timed-out jobs are retried at all.
    pub retry_on_failure: bool,
    /// Retry budget per worker per second; scales the global retry bucket.
    pub per_worker_qps: u32,
    /// Deadline for a single job execution.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// How long `Executor::shutdown` waits for in-flight jobs.
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Stack size of each worker thread in bytes.
    pub thread_stack_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            worker_count: num_cpus::get(),
            max_job_retries: 3,
            base_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_secs(1000),
            retry_on_failure: true,
            per_worker_qps: 10,
            timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl ExecutorConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the retry limit.
    #[must_use]
    pub const fn with_max_job_retries(mut self, retries: u32) -> Self {
        self.max_job_retries = retries;
        self
    }

    /// Set the first retry delay.
    #[must_use]
    pub const fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    /// Set the retry delay ceiling.
    #[must_use]
    pub const fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Enable or disable retries.
    #[must_use]
    pub const fn with_retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    /// Set the per-worker retry rate.
    #[must_use]
    pub const fn with_per_worker_qps(mut self, qps: u32) -> Self {
        self.per_worker_qps = qps;
        self
    }

    /// Set the per-job deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the shutdown budget.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.per_worker_qps == 0 {
            return Err("per_worker_qps must be greater than 0".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than 0".into());
        }
        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".into());
        }
        if self.timeout > MAX_TIMEOUT || self.shutdown_timeout > MAX_TIMEOUT {
            return Err("timeout and shutdown_timeout must not exceed one year".into());
        }
        if self.max_retry_delay < self.base_retry_delay {
            return Err("max_retry_delay must not be less than base_retry_delay".into());
        }
        if self.thread_stack_size < MIN_THREAD_STACK_SIZE {
            return Err(format!(
                "thread_stack_size must be at least {MIN_THREAD_STACK_SIZE} bytes"
            ));
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON (including negative numbers) or invalid values.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `ACTION_EXECUTOR_*` environment variables.
    ///
    /// A `.env` file is read first if present. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable does not parse or the result is invalid.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Some(v) = env_var("QUEUE_CAPACITY")? {
            cfg.queue_capacity = v;
        }
        if let Some(v) = env_var("WORKER_COUNT")? {
            cfg.worker_count = v;
        }
        if let Some(v) = env_var("MAX_JOB_RETRIES")? {
            cfg.max_job_retries = v;
        }
        if let Some(v) = env_var("BASE_RETRY_DELAY_MS")? {
            cfg.base_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_var("MAX_RETRY_DELAY_MS")? {
            cfg.max_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_var("RETRY_ON_FAILURE")? {
            cfg.retry_on_failure = v;
        }
        if let Some(v) = env_var("PER_WORKER_QPS")? {
            cfg.per_worker_qps = v;
        }
        if let Some(v) = env_var("TIMEOUT_MS")? {
            cfg.timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_var("SHUTDOWN_TIMEOUT_MS")? {
            cfg.shutdown_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_var("THREAD_STACK_SIZE")? {
            cfg.thread_stack_size = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var<T>(suffix: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{suffix}");
    match env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{name}: {e}")),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ExecutorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let cfg = ExecutorConfig::new()
            .with_queue_capacity(3)
            .with_worker_count(2)
            .with_max_job_retries(5)
            .with_base_retry_delay(Duration::from_millis(50))
            .with_timeout(Duration::from_secs(1));
        assert_eq!(cfg.queue_capacity, 3);
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.max_job_retries, 5);
        assert_eq!(cfg.base_retry_delay, Duration::from_millis(50));
        assert_eq!(cfg.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_json_uses_millisecond_keys() {
        let cfg = ExecutorConfig::from_json_str(
            r#"{"queue_capacity": 8, "worker_count": 2, "timeout_ms": 1500, "base_retry_delay_ms": 0}"#,
        )
        .unwrap();
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.base_retry_delay, Duration::ZERO);
        assert_eq!(cfg.max_job_retries, 3);

        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["timeout_ms"], 1500);
    }

    #[test]
    fn test_json_rejects_negative_and_zero() {
        assert!(ExecutorConfig::from_json_str(r#"{"max_job_retries": -1}"#).is_err());
        assert!(ExecutorConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
        assert!(ExecutorConfig::from_json_str(r#"{"timeout_ms": 0}"#).is_err());
    }
}
