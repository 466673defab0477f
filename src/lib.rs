//! # Action Executor
//!
//! An in-process trigger engine core: a deduplicating, delay-aware,
//! capacity-bounded queue paired with a bounded worker pool that runs jobs
//! under per-job deadlines, keeps jobs sharing an identity from overlapping,
//! and retries failures with exponential backoff.
//!
//! ## Core Problem Solved
//!
//! Automation triggers fire in bursts. The same action configuration is often
//! requested many times while a previous run is still queued or in flight, and
//! failing actions must be retried without hammering the system:
//!
//! - **Latest wins**: duplicate submissions for a pending job merge; one arriving
//!   while the job runs triggers exactly one follow-up run
//! - **Backpressure**: the queue is bounded and `add_job` fails fast when full
//! - **Backoff**: failures and timeouts are retried with per-job exponential
//!   delay under a global retry budget
//! - **Isolation**: a failing or panicking job never takes a worker down
//!
//! ## Example
//!
//! ```rust,ignore
//! use action_executor::config::ExecutorConfig;
//! use action_executor::core::{AppResult, Executor, Job, JobContext, JobKey};
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Restart { key: JobKey }
//!
//! #[async_trait]
//! impl Job for Restart {
//!     fn key(&self) -> JobKey { self.key.clone() }
//!     async fn run(&self, _ctx: JobContext) -> AppResult<()> { Ok(()) }
//! }
//!
//! let executor = Executor::new(ExecutorConfig::new().with_worker_count(4))?;
//! let ctx = CancellationToken::new();
//! executor.run_jobs(&ctx)?;
//! executor.submit(Restart { key: JobKey::from("restart:web") })?;
//!
//! ctx.cancel();
//! assert!(executor.shutdown());
//! ```
//!
//! For complete examples, see `tests/executor_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct executor components from configuration.
pub mod builders;
/// Configuration models for the executor.
pub mod config;
/// Job model, errors and the worker pool.
pub mod core;
/// Delaying queue and retry rate limiters.
pub mod infra;
/// Event-to-job glue for sources, filters and actions.
pub mod pipeline;
/// Shared utilities.
pub mod util;
