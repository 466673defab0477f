//! Delaying, deduplicating work queue.

use std::fmt::Debug;
use std::hash::Hash;

pub mod delaying;
pub mod wait;

pub use delaying::DelayingQueue;
pub use wait::WaitEntry;

/// An item that can be stored in a [`DelayingQueue`].
pub trait QueueItem: Send + 'static {
    /// Deduplication key.
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Identity of this item.
    fn key(&self) -> Self::Key;

    /// Whether `self` should replace `pending` when both are queued under one key.
    fn supersedes(&self, _pending: &Self) -> bool {
        true
    }
}
