//! Job model: identity, execution context and the `Job` trait.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::AppResult;
use crate::infra::queue::QueueItem;

/// Opaque deduplication identity of a job.
///
/// Cloning is cheap; the key text is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(Arc<str>);

impl JobKey {
    /// Create a key from arbitrary text.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Derive a key from an action type and its configured properties.
    ///
    /// `serde_json` keeps object keys sorted, so two equal property sets
    /// always render to the same text and therefore the same key.
    #[must_use]
    pub fn for_action(action_type: &str, properties: &serde_json::Value) -> Self {
        Self(format!("{action_type}:{properties}").into())
    }

    /// Key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobKey({})", self.0)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Context handed to a running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Unique identifier of this execution attempt.
    pub run_id: Uuid,
    /// Number of times the job has been requeued after failing.
    pub attempt: u32,
    /// Instant at which the job is considered timed out.
    pub deadline: Instant,
    /// Cancelled when the deadline fires.
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Time left before the deadline; zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the job has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of work produced by the action pipeline.
///
/// A panic inside [`run`](Job::run) counts as a failed attempt. The identity
/// methods (`key`, `lock_key`, `allows_concurrency`) must not panic: a job
/// whose identity panics is dropped without running.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use action_executor::core::{AppResult, Job, JobContext, JobKey};
///
/// struct Notify {
///     key: JobKey,
/// }
///
/// #[async_trait]
/// impl Job for Notify {
///     fn key(&self) -> JobKey {
///         self.key.clone()
///     }
///
///     async fn run(&self, ctx: JobContext) -> AppResult<()> {
///         tokio::time::sleep(ctx.remaining() / 2).await;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Deduplication identity used by the queue and the rate limiter.
    fn key(&self) -> JobKey;

    /// Identity used for mutual exclusion between running jobs.
    fn lock_key(&self) -> JobKey {
        self.key()
    }

    /// Whether jobs sharing `lock_key` may run at the same time.
    fn allows_concurrency(&self) -> bool {
        false
    }

    /// Optional monotonic version of the job's source state.
    fn revision(&self) -> Option<u64> {
        None
    }

    /// Whether this submission should replace a pending duplicate.
    ///
    /// Compares revisions when both sides carry one, otherwise always replaces.
    fn supersedes(&self, pending: &dyn Job) -> bool {
        match (self.revision(), pending.revision()) {
            (Some(new), Some(old)) => new >= old,
            _ => true,
        }
    }

    /// Execute the job. The executor abandons the future once `ctx.deadline` passes.
    async fn run(&self, ctx: JobContext) -> AppResult<()>;
}

/// Shared, type-erased job handle as stored in the queue.
pub type SharedJob = Arc<dyn Job>;

impl QueueItem for SharedJob {
    type Key = JobKey;

    fn key(&self) -> JobKey {
        Job::key(self.as_ref())
    }

    fn supersedes(&self, pending: &Self) -> bool {
        Job::supersedes(self.as_ref(), pending.as_ref())
    }
}

/// Classified result of one execution attempt.
#[derive(Debug)]
pub enum JobOutcome {
    /// The job returned `Ok` before its deadline.
    Succeeded,
    /// The job returned an error.
    Failed(anyhow::Error),
    /// The deadline fired before the job returned.
    TimedOut,
    /// The job panicked.
    Panicked(String),
}

impl JobOutcome {
    /// Whether the attempt counts as a success for retry accounting.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Versioned(Option<u64>);

    #[async_trait]
    impl Job for Versioned {
        fn key(&self) -> JobKey {
            JobKey::from("versioned")
        }

        fn revision(&self) -> Option<u64> {
            self.0
        }

        async fn run(&self, _ctx: JobContext) -> AppResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_key_for_action_is_order_independent() {
        let a = JobKey::for_action("webhook", &json!({"url": "http://x", "method": "POST"}));
        let b = JobKey::for_action("webhook", &json!({"method": "POST", "url": "http://x"}));
        assert_eq!(a, b);

        let c = JobKey::for_action("script", &json!({"method": "POST", "url": "http://x"}));
        assert_ne!(a, c);
    }

    #[test]
    fn test_supersedes_by_revision() {
        let old = Versioned(Some(4));
        let new = Versioned(Some(5));
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(Versioned(None).supersedes(&old));
        assert!(old.supersedes(&Versioned(None)));
    }

    #[test]
    fn test_shared_job_queue_item() {
        let job: SharedJob = Arc::new(Versioned(Some(1)));
        assert_eq!(QueueItem::key(&job), JobKey::from("versioned"));
        let newer: SharedJob = Arc::new(Versioned(Some(2)));
        assert!(QueueItem::supersedes(&newer, &job));
    }
}
