//! Concurrent data structures backing the executor: the delaying queue and retry limiters.

pub mod queue;
pub mod ratelimit;
