//! Event-to-job glue: filter chain, actions, submission.
//!
//! Sources and the concrete filter and action types live outside this crate.
//! They plug in through [`Filter`] and [`Action`]; the pipeline runs every
//! event through the filters and submits one job per action for each kept event.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Executor, ExecutorError, SharedJob};

/// Decides whether an event is kept.
pub trait Filter<E>: Send + Sync {
    /// Return `false` to drop the event.
    fn keep(&self, event: &E) -> bool;
}

impl<E, F> Filter<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn keep(&self, event: &E) -> bool {
        self(event)
    }
}

/// Turns a kept event into a job.
///
/// Implementations should derive the job key with
/// [`JobKey::for_action`](crate::core::JobKey::for_action) so that identical
/// action configurations deduplicate.
pub trait Action<E>: Send + Sync {
    /// Name of the action type.
    fn action_type(&self) -> &str;

    /// Build the job for `event`, or `None` if the action does not apply.
    fn job_for(&self, event: &E) -> Option<SharedJob>;
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// The filter chain dropped the event.
    pub dropped: bool,
    /// Jobs accepted by the executor.
    pub queued: usize,
    /// Jobs refused because the queue was full or shut down.
    pub rejected: usize,
    /// Actions that produced no job for the event.
    pub skipped: usize,
}

/// A named filter chain with its actions, feeding one executor.
pub struct Pipeline<E> {
    name: String,
    filters: Vec<Box<dyn Filter<E>>>,
    actions: Vec<Box<dyn Action<E>>>,
    executor: Arc<Executor>,
}

impl<E> Pipeline<E> {
    /// Create an empty pipeline submitting to `executor`.
    pub fn new(name: impl Into<String>, executor: Arc<Executor>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            actions: Vec::new(),
            executor,
        }
    }

    /// Append a filter. Filters run in insertion order and short-circuit.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Filter<E> + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Append an action.
    #[must_use]
    pub fn with_action(mut self, action: impl Action<E> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filter `event` and submit a job per action.
    ///
    /// Submission failures are counted and logged, never returned: a slow
    /// executor must not stall the event source.
    pub fn dispatch(&self, event: &E) -> DispatchReport {
        let mut report = DispatchReport::default();

        if !self.filters.iter().all(|filter| filter.keep(event)) {
            debug!(pipeline = %self.name, "event dropped by filter chain");
            report.dropped = true;
            return report;
        }

        for action in &self.actions {
            let Some(job) = action.job_for(event) else {
                report.skipped += 1;
                continue;
            };
            match self.executor.add_job(job) {
                Ok(()) => report.queued += 1,
                Err(e @ (ExecutorError::QueueFull { .. } | ExecutorError::ShutDown)) => {
                    warn!(
                        pipeline = %self.name,
                        action = action.action_type(),
                        error = %e,
                        "job not queued"
                    );
                    report.rejected += 1;
                }
                Err(e) => {
                    warn!(pipeline = %self.name, action = action.action_type(), error = %e, "unexpected submit error");
                    report.rejected += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::core::{AppResult, Job, JobContext, JobKey};
    use async_trait::async_trait;
    use serde_json::json;

    struct Event {
        kind: &'static str,
        name: &'static str,
    }

    struct Webhook {
        key: JobKey,
    }

    #[async_trait]
    impl Job for Webhook {
        fn key(&self) -> JobKey {
            self.key.clone()
        }

        async fn run(&self, _ctx: JobContext) -> AppResult<()> {
            Ok(())
        }
    }

    struct WebhookAction;

    impl Action<Event> for WebhookAction {
        fn action_type(&self) -> &str {
            "webhook"
        }

        fn job_for(&self, event: &Event) -> Option<SharedJob> {
            let props = json!({"url": "http://hooks.local", "name": event.name});
            Some(Arc::new(Webhook {
                key: JobKey::for_action(self.action_type(), &props),
            }))
        }
    }

    struct NeverAction;

    impl Action<Event> for NeverAction {
        fn action_type(&self) -> &str {
            "never"
        }

        fn job_for(&self, _event: &Event) -> Option<SharedJob> {
            None
        }
    }

    fn pipeline(capacity: usize) -> Pipeline<Event> {
        let executor =
            Arc::new(Executor::new(ExecutorConfig::new().with_queue_capacity(capacity)).unwrap());
        Pipeline::new("pods", executor)
            .with_filter(|e: &Event| e.kind == "Pod")
            .with_action(WebhookAction)
            .with_action(NeverAction)
    }

    #[test]
    fn test_filter_drops_events() {
        let p = pipeline(4);
        let report = p.dispatch(&Event { kind: "Service", name: "a" });
        assert!(report.dropped);
        assert_eq!(report.queued, 0);
        assert!(p.executor.is_empty());
    }

    #[test]
    fn test_identical_configurations_dedup() {
        let p = pipeline(4);
        let first = p.dispatch(&Event { kind: "Pod", name: "a" });
        let second = p.dispatch(&Event { kind: "Pod", name: "a" });
        assert_eq!(first, DispatchReport { dropped: false, queued: 1, rejected: 0, skipped: 1 });
        assert_eq!(second.queued, 1);
        assert_eq!(p.executor.len(), 1);

        p.dispatch(&Event { kind: "Pod", name: "b" });
        assert_eq!(p.executor.len(), 2);
    }

    #[test]
    fn test_full_queue_is_reported_not_propagated() {
        let p = pipeline(1);
        p.dispatch(&Event { kind: "Pod", name: "a" });
        let report = p.dispatch(&Event { kind: "Pod", name: "b" });
        assert_eq!(report.rejected, 1);
        assert_eq!(report.queued, 0);
    }
}
