//! Tests for configuration loading and the default retry limiter

use action_executor::builders::build_rate_limiter;
use action_executor::config::ExecutorConfig;
use action_executor::core::JobKey;
use action_executor::infra::ratelimit::RateLimiter;
use std::time::Duration;

#[test]
fn test_config_from_json_partial() {
    let cfg = ExecutorConfig::from_json_str(
        r#"{"queue_capacity": 3, "worker_count": 2, "timeout_ms": 250, "retry_on_failure": false}"#,
    )
    .expect("valid config");

    assert_eq!(cfg.queue_capacity, 3);
    assert_eq!(cfg.worker_count, 2);
    assert_eq!(cfg.timeout, Duration::from_millis(250));
    assert!(!cfg.retry_on_failure);
    assert_eq!(cfg.max_job_retries, ExecutorConfig::default().max_job_retries);
}

#[test]
fn test_config_from_json_invalid() {
    assert!(ExecutorConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
    assert!(ExecutorConfig::from_json_str(r#"{"base_retry_delay_ms": 500, "max_retry_delay_ms": 100}"#).is_err());
    assert!(ExecutorConfig::from_json_str("not json").is_err());
}

// Only test in this binary touching the process environment.
#[test]
fn test_config_from_env() {
    std::env::set_var("ACTION_EXECUTOR_WORKER_COUNT", "7");
    std::env::set_var("ACTION_EXECUTOR_TIMEOUT_MS", "1500");
    std::env::set_var("ACTION_EXECUTOR_RETRY_ON_FAILURE", "false");

    let cfg = ExecutorConfig::from_env().expect("valid env config");
    assert_eq!(cfg.worker_count, 7);
    assert_eq!(cfg.timeout, Duration::from_millis(1500));
    assert!(!cfg.retry_on_failure);

    std::env::set_var("ACTION_EXECUTOR_WORKER_COUNT", "many");
    let err = ExecutorConfig::from_env().unwrap_err();
    assert!(err.contains("ACTION_EXECUTOR_WORKER_COUNT"));

    std::env::remove_var("ACTION_EXECUTOR_WORKER_COUNT");
    std::env::remove_var("ACTION_EXECUTOR_TIMEOUT_MS");
    std::env::remove_var("ACTION_EXECUTOR_RETRY_ON_FAILURE");
}

#[test]
fn test_default_limiter_tracks_keys_independently() {
    let cfg = ExecutorConfig::new()
        .with_worker_count(1)
        .with_base_retry_delay(Duration::from_millis(10))
        .with_max_retry_delay(Duration::from_millis(40));
    let limiter = build_rate_limiter(&cfg);
    let a = JobKey::from("a");
    let b = JobKey::from("b");

    let delays: Vec<_> = (0..4).map(|_| limiter.when(&a)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(40),
        ]
    );
    assert_eq!(limiter.num_requeues(&a), 4);
    assert_eq!(limiter.num_requeues(&b), 0);
    assert_eq!(limiter.when(&b), Duration::from_millis(10));

    limiter.forget(&a);
    assert_eq!(limiter.num_requeues(&a), 0);
}
