//! Bounded worker pool draining the delaying queue.
//!
//! Each worker is a dedicated OS thread with its own single-threaded tokio
//! runtime, so job futures never block the caller's runtime. Workers:
//!
//! 1. take the next visible job from the queue;
//! 2. push it back if its lock identity is already running and it does not allow concurrency;
//! 3. run it under the configured deadline;
//! 4. on success forget its failure history; on failure or timeout requeue it with
//!    backoff until `max_job_retries` is reached, then abandon it.
//!
//! Job failures never escape a worker loop.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builders::build_rate_limiter;
use crate::config::ExecutorConfig;
use crate::core::{ExecutorError, Job, JobKey, QueueError, SharedJob};
use crate::infra::queue::DelayingQueue;
use crate::infra::ratelimit::RateLimiter;

/// Delay before a job whose lock identity is busy is offered again.
pub const CONFLICT_REQUEUE_DELAY: Duration = Duration::from_millis(5);

/// Snapshot of executor activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Number of worker threads started.
    pub worker_count: usize,
    /// Jobs admitted or in flight (the queue length).
    pub queued: usize,
    /// Jobs currently executing.
    pub active: u64,
    /// Jobs accepted by `add_job`.
    pub submitted: u64,
    /// Jobs refused because the queue was full.
    pub rejected: u64,
    /// Executions that succeeded.
    pub succeeded: u64,
    /// Executions that returned an error or panicked.
    pub failed: u64,
    /// Executions that exceeded their deadline.
    pub timed_out: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Jobs dropped after failing without a retry left.
    pub abandoned: u64,
}

/// Lock-free activity counters.
#[derive(Debug, Default)]
pub(crate) struct ExecutorCounters {
    pub active: AtomicU64,
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub retried: AtomicU64,
    pub abandoned: AtomicU64,
}

impl ExecutorCounters {
    fn snapshot(&self, worker_count: usize, queued: usize) -> ExecutorStats {
        ExecutorStats {
            worker_count,
            queued,
            active: self.active.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Lock identities of executing jobs with their number of concurrent runs.
#[derive(Debug, Default)]
pub(crate) struct RunningSet {
    runs: Mutex<HashMap<JobKey, usize>>,
}

impl RunningSet {
    /// Mark `key` running. Fails when `exclusive` and another run holds the key.
    pub(crate) fn try_acquire(&self, key: &JobKey, exclusive: bool) -> bool {
        let mut runs = self.runs.lock();
        let count = runs.entry(key.clone()).or_insert(0);
        if exclusive && *count > 0 {
            return false;
        }
        *count += 1;
        true
    }

    pub(crate) fn release(&self, key: &JobKey) {
        let mut runs = self.runs.lock();
        if let Some(count) = runs.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                runs.remove(key);
            }
        }
    }
}

/// State shared by the executor handle and its workers.
pub(crate) struct Inner {
    pub config: ExecutorConfig,
    pub queue: DelayingQueue<SharedJob>,
    pub limiter: Box<dyn RateLimiter<JobKey>>,
    pub running: RunningSet,
    pub counters: ExecutorCounters,
    /// Cancelled by `shutdown`; independent of the caller's run context.
    pub stop: CancellationToken,
}

/// Worker pool executing queued jobs with retry, backoff and mutual exclusion.
///
/// # Example
///
/// ```rust,ignore
/// use action_executor::config::ExecutorConfig;
/// use action_executor::core::Executor;
/// use tokio_util::sync::CancellationToken;
///
/// let executor = Executor::new(ExecutorConfig::new().with_worker_count(4))?;
/// let ctx = CancellationToken::new();
/// executor.run_jobs(&ctx)?;
///
/// executor.submit(my_job)?;
///
/// ctx.cancel();
/// let clean = executor.shutdown();
/// ```
pub struct Executor {
    inner: Arc<Inner>,
    accepting: AtomicBool,
    started: AtomicBool,
    /// Workers spawned by `run_jobs`; unaffected by joining them.
    spawned: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    exit_tx: Sender<usize>,
    exit_rx: Receiver<usize>,
    shutdown_result: Mutex<Option<bool>>,
}

impl Executor {
    /// Create an executor with the default retry limiter: per-job exponential
    /// backoff combined with a global token bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        config.validate().map_err(ExecutorError::InvalidConfig)?;
        let limiter = build_rate_limiter(&config);
        Self::with_rate_limiter(config, Box::new(limiter))
    }

    /// Create an executor with a custom retry limiter.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidConfig`] if the configuration is invalid,
    /// or [`ExecutorError::Internal`] if the queue cannot start.
    pub fn with_rate_limiter(
        config: ExecutorConfig,
        limiter: Box<dyn RateLimiter<JobKey>>,
    ) -> Result<Self, ExecutorError> {
        config.validate().map_err(ExecutorError::InvalidConfig)?;

        let queue = DelayingQueue::new(config.queue_capacity)
            .map_err(|e| ExecutorError::Internal(format!("failed to start queue: {e}")))?;
        let (exit_tx, exit_rx) = bounded(config.worker_count);

        info!(
            worker_count = config.worker_count,
            queue_capacity = config.queue_capacity,
            max_job_retries = config.max_job_retries,
            timeout_ms = config.timeout.as_millis() as u64,
            "executor initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                queue,
                limiter,
                running: RunningSet::default(),
                counters: ExecutorCounters::default(),
                stop: CancellationToken::new(),
            }),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
            exit_tx,
            exit_rx,
            shutdown_result: Mutex::new(None),
        })
    }

    /// Enqueue a job without blocking.
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::QueueFull`] if the queue is at capacity
    /// - [`ExecutorError::ShutDown`] if the executor has been shut down
    pub fn add_job(&self, job: SharedJob) -> Result<(), ExecutorError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ExecutorError::ShutDown);
        }

        let key = job.key();
        match self.inner.queue.try_add(job) {
            Ok(()) => {
                self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "job queued");
                Ok(())
            }
            Err(QueueError::Full) => {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, capacity = self.inner.config.queue_capacity, "action queue is full");
                Err(ExecutorError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                })
            }
            Err(QueueError::ShuttingDown) => Err(ExecutorError::ShutDown),
        }
    }

    /// Enqueue a concrete job. See [`add_job`](Self::add_job).
    ///
    /// # Errors
    ///
    /// Same as [`add_job`](Self::add_job).
    pub fn submit<J: Job>(&self, job: J) -> Result<(), ExecutorError> {
        self.add_job(Arc::new(job))
    }

    /// Start the worker threads. Returns once they are spawned.
    ///
    /// Workers stop taking new jobs once `ctx` is cancelled or
    /// [`shutdown`](Self::shutdown) is called; a job already running finishes first.
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::AlreadyRunning`] if called more than once
    /// - [`ExecutorError::ShutDown`] after shutdown
    /// - [`ExecutorError::Internal`] if a thread cannot be spawned
    pub fn run_jobs(&self, ctx: &CancellationToken) -> Result<(), ExecutorError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ExecutorError::ShutDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ExecutorError::AlreadyRunning);
        }

        let mut workers = self.workers.lock();
        for worker_id in 0..self.inner.config.worker_count {
            let handle = worker::spawn_worker(
                worker_id,
                Arc::clone(&self.inner),
                ctx.clone(),
                self.exit_tx.clone(),
            )
            .map_err(|e| ExecutorError::Internal(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
            self.spawned.fetch_add(1, Ordering::Relaxed);
        }

        let watcher = worker::spawn_context_watcher(Arc::clone(&self.inner), ctx.clone())
            .map_err(|e| ExecutorError::Internal(format!("failed to spawn watcher: {e}")))?;
        *self.watcher.lock() = Some(watcher);

        info!(worker_count = workers.len(), "executor workers started");
        Ok(())
    }

    /// Stop accepting jobs, signal workers and wait up to `shutdown_timeout`
    /// for in-flight jobs to finish.
    ///
    /// Returns `true` if every worker exited within the budget. Jobs that were
    /// queued but never started are discarded. Idempotent: later calls return
    /// the first result.
    pub fn shutdown(&self) -> bool {
        let mut result = self.shutdown_result.lock();
        if let Some(clean) = *result {
            return clean;
        }

        self.accepting.store(false, Ordering::Release);
        info!("shutting down executor");

        self.inner.stop.cancel();
        self.inner.queue.shut_down();

        let expected = self.workers.lock().len();
        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        let mut exited = 0;
        while exited < expected {
            match self.exit_rx.recv_deadline(deadline) {
                Ok(worker_id) => {
                    debug!(worker_id, "worker exited");
                    exited += 1;
                }
                Err(_) => break,
            }
        }
        let clean = exited == expected;

        if clean {
            for handle in self.workers.lock().drain(..) {
                if handle.join().is_err() {
                    warn!("worker thread panicked");
                }
            }
        }
        if let Some(watcher) = self.watcher.lock().take() {
            if watcher.join().is_err() {
                warn!("context watcher panicked");
            }
        }

        let discarded = self.inner.queue.discard_pending();
        if clean {
            info!(discarded, "executor shut down cleanly");
        } else {
            warn!(
                discarded,
                still_running = expected - exited,
                timeout_ms = self.inner.config.shutdown_timeout.as_millis() as u64,
                "executor shutdown timed out; detaching workers"
            );
        }

        *result = Some(clean);
        clean
    }

    /// Number of jobs admitted or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether no jobs are admitted or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Failures recorded for `key` since its last success or abandonment.
    #[must_use]
    pub fn num_requeues(&self, key: &JobKey) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        self.inner
            .counters
            .snapshot(self.spawned.load(Ordering::Relaxed), self.inner.queue.len())
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Signal but do not join; explicit shutdown() is the graceful path.
        if self.accepting.swap(false, Ordering::AcqRel) {
            self.inner.stop.cancel();
            self.inner.queue.shut_down();
            debug!("executor dropped without explicit shutdown - workers will be detached");
        }
    }
}
