//! Worker threads and the per-job execute / classify / retry cycle.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;
use futures::FutureExt;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Inner, CONFLICT_REQUEUE_DELAY};
use crate::core::{JobContext, JobKey, JobOutcome, SharedJob};

/// Spawn a worker thread. It reports its id on `exit_tx` when it stops.
pub(super) fn spawn_worker(
    worker_id: usize,
    inner: Arc<Inner>,
    ctx: CancellationToken,
    exit_tx: Sender<usize>,
) -> io::Result<JoinHandle<()>> {
    let stack_size = inner.config.thread_stack_size;
    thread::Builder::new()
        .name(format!("action-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");

            // Each worker has its own single-threaded tokio runtime
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => worker_loop(worker_id, &inner, &ctx, &rt),
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                }
            }

            debug!(worker_id, "worker thread exiting");
            let _ = exit_tx.send(worker_id);
        })
}

/// Shut the queue down when the run context is cancelled so that workers
/// blocked in `get` wake up. Exits quietly on executor shutdown.
pub(super) fn spawn_context_watcher(
    inner: Arc<Inner>,
    ctx: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("action-ctx-watch".into())
        .spawn(move || {
            futures::executor::block_on(async {
                let run_ctx = std::pin::pin!(ctx.cancelled());
                let stop = std::pin::pin!(inner.stop.cancelled());
                futures::future::select(run_ctx, stop).await;
            });
            if ctx.is_cancelled() && !inner.stop.is_cancelled() {
                info!("run context cancelled; stopping action queue");
                inner.queue.shut_down();
            }
        })
}

fn stopping(inner: &Inner, ctx: &CancellationToken) -> bool {
    ctx.is_cancelled() || inner.stop.is_cancelled()
}

fn worker_loop(worker_id: usize, inner: &Inner, ctx: &CancellationToken, rt: &Runtime) {
    while !stopping(inner, ctx) {
        let Some(job) = inner.queue.get() else {
            debug!(worker_id, "queue shut down");
            break;
        };

        if stopping(inner, ctx) {
            debug!(worker_id, key = %job.key(), "dropping job picked up during shutdown");
            inner.limiter.forget(&job.key());
            inner.queue.done(&job);
            break;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            process(worker_id, inner, Arc::clone(&job), rt);
        }));
        if let Err(panic) = outcome {
            // Only the job's identity methods run outside the guarded future.
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, panic = %panic_message(panic.as_ref()), "job panicked before running; dropping it");
            if panic::catch_unwind(AssertUnwindSafe(|| inner.queue.done(&job))).is_err() {
                error!(worker_id, "job key panicked; its queue slot stays occupied");
            }
        }
    }
}

fn process(worker_id: usize, inner: &Inner, job: SharedJob, rt: &Runtime) {
    let key = job.key();
    let lock_key = job.lock_key();

    if !inner.running.try_acquire(&lock_key, !job.allows_concurrency()) {
        debug!(worker_id, key = %key, lock_key = %lock_key, "identity busy; requeueing");
        if let Err(e) = inner.queue.requeue_after(Arc::clone(&job), CONFLICT_REQUEUE_DELAY) {
            debug!(worker_id, key = %key, error = %e, "busy job dropped");
        }
        inner.queue.done(&job);
        return;
    }

    let attempt = inner.limiter.num_requeues(&key);
    let outcome = execute(worker_id, inner, &job, attempt, rt);
    inner.running.release(&lock_key);

    settle(worker_id, inner, &job, &key, attempt, outcome);
}

fn execute(
    worker_id: usize,
    inner: &Inner,
    job: &SharedJob,
    attempt: u32,
    rt: &Runtime,
) -> JobOutcome {
    let timeout = inner.config.timeout;
    let cancel = CancellationToken::new();
    let deadline = Instant::now() + timeout;
    let ctx = JobContext {
        run_id: Uuid::new_v4(),
        attempt,
        deadline,
        cancel: cancel.clone(),
    };

    debug!(worker_id, key = %job.key(), run_id = %ctx.run_id, attempt, "executing job");
    inner.counters.active.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let outcome = rt.block_on(async {
        // The call itself runs inside the guarded future.
        let run = AssertUnwindSafe(async { job.run(ctx).await }).catch_unwind();
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(()))) => JobOutcome::Succeeded,
            Ok(Ok(Err(e))) => JobOutcome::Failed(e),
            Ok(Err(panic)) => JobOutcome::Panicked(panic_message(panic.as_ref())),
            Err(_) => JobOutcome::TimedOut,
        }
    });

    // A job that blocks its thread past the deadline is only observed after it returns.
    let outcome = match outcome {
        JobOutcome::Succeeded if Instant::now() >= deadline => JobOutcome::TimedOut,
        other => other,
    };

    if matches!(outcome, JobOutcome::TimedOut) {
        cancel.cancel();
    }
    inner.counters.active.fetch_sub(1, Ordering::Relaxed);
    debug!(
        worker_id,
        key = %job.key(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        success = outcome.is_success(),
        "job finished"
    );
    outcome
}

fn settle(
    worker_id: usize,
    inner: &Inner,
    job: &SharedJob,
    key: &JobKey,
    attempt: u32,
    outcome: JobOutcome,
) {
    match outcome {
        JobOutcome::Succeeded => {
            inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            inner.limiter.forget(key);
            inner.queue.done(job);
            return;
        }
        JobOutcome::Failed(e) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, key = %key, attempt, error = %format!("{e:#}"), "job failed");
        }
        JobOutcome::TimedOut => {
            inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id,
                key = %key,
                attempt,
                timeout_ms = inner.config.timeout.as_millis() as u64,
                "job exceeded its deadline"
            );
        }
        JobOutcome::Panicked(message) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, key = %key, attempt, panic = %message, "job panicked");
        }
    }

    let config = &inner.config;
    if config.retry_on_failure && inner.limiter.num_requeues(key) < config.max_job_retries {
        let delay = inner.limiter.when(key);
        match inner.queue.requeue_after(Arc::clone(job), delay) {
            Ok(()) => {
                inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker_id,
                    key = %key,
                    requeues = inner.limiter.num_requeues(key),
                    delay_ms = delay.as_millis() as u64,
                    "job scheduled for retry"
                );
            }
            Err(e) => {
                debug!(worker_id, key = %key, error = %e, "retry dropped");
                inner.limiter.forget(key);
            }
        }
        inner.queue.done(job);
        return;
    }

    inner.counters.abandoned.fetch_add(1, Ordering::Relaxed);
    inner.limiter.forget(key);
    inner.queue.done(job);
    if config.retry_on_failure {
        warn!(worker_id, key = %key, retries = config.max_job_retries, "job abandoned after exhausting retries");
    } else {
        warn!(worker_id, key = %key, "job abandoned; retries disabled");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
