//! Capacity-bounded queue with delayed admission and per-key deduplication.
//!
//! Items move through three places:
//!
//! - the **prepare set**: admitted but not yet handed to a worker. An entry
//!   is either waiting for its ready time (tracked by the admission loop's
//!   delay heap) or visible in the FIFO list consumed by [`DelayingQueue::get`];
//! - the **processing set**: checked out by a worker until [`DelayingQueue::done`];
//! - the **dirty set**: the newest arrival for a key that is currently processing.
//!   It is requeued when the running instance is marked done.
//!
//! A key is never in both the prepare and processing sets, and
//! `prepare + processing` never exceeds the capacity.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards all sets and the visibility list
//! - `visible_cv` wakes consumers; `capacity_cv` wakes blocked producers and drain waiters
//! - The delay heap lives on a dedicated thread fed by a bounded crossbeam channel

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex, Once};
use tracing::{debug, info};

use super::wait::{run_admission_loop, WaitEntry};
use super::QueueItem;
use crate::core::QueueError;

/// Maximum time the admission loop sleeps between checks.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Buffered delayed admissions before producers briefly block on the channel.
const ADMISSION_BUFFER: usize = 1000;

/// Delays are clamped so that `Instant + delay` cannot overflow.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// An admitted item and its ready time.
struct Pending<T> {
    item: T,
    ready_at: Instant,
    /// Already pushed onto the visibility list.
    visible: bool,
}

impl<T: QueueItem> Pending<T> {
    /// Merge a duplicate arrival. Returns true when the ready time moved earlier.
    fn merge(&mut self, item: T, ready_at: Instant, replace: bool) -> bool {
        if replace && item.supersedes(&self.item) {
            self.item = item;
        }
        if ready_at < self.ready_at {
            self.ready_at = ready_at;
            true
        } else {
            false
        }
    }
}

struct State<T: QueueItem> {
    capacity: usize,
    prepare: HashMap<T::Key, Pending<T>>,
    processing: HashSet<T::Key>,
    dirty: HashMap<T::Key, Pending<T>>,
    visible: VecDeque<T::Key>,
    shutting_down: bool,
}

impl<T: QueueItem> State<T> {
    fn len(&self) -> usize {
        self.prepare.len() + self.processing.len()
    }

    fn make_visible(&mut self, key: T::Key, mut pending: Pending<T>) {
        pending.visible = true;
        self.visible.push_back(key.clone());
        self.prepare.insert(key, pending);
    }
}

/// State shared between the queue handle and its admission loop.
pub(super) struct Shared<T: QueueItem> {
    state: Mutex<State<T>>,
    visible_cv: Condvar,
    capacity_cv: Condvar,
}

impl<T: QueueItem> Shared<T> {
    /// Make due heap entries visible. Entries whose ready time no longer
    /// matches the prepare set are stale and ignored.
    pub(super) fn promote(&self, due: Vec<WaitEntry<T::Key>>) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut promoted = 0;
        for entry in due {
            let current = state
                .prepare
                .get_mut(&entry.key)
                .filter(|p| !p.visible && p.ready_at == entry.ready_at);
            if let Some(pending) = current {
                pending.visible = true;
                state.visible.push_back(entry.key);
                promoted += 1;
            }
        }
        drop(guard);

        match promoted {
            0 => {}
            1 => {
                self.visible_cv.notify_one();
            }
            _ => {
                self.visible_cv.notify_all();
            }
        }
        promoted
    }
}

/// Deduplicating, delay-aware, capacity-bounded blocking queue.
///
/// # Example
///
/// ```rust,ignore
/// let queue = DelayingQueue::new(16)?;
/// queue.add_after(item, Duration::from_millis(50))?;
/// if let Some(item) = queue.get() {
///     process(&item);
///     queue.done(&item);
/// }
/// queue.shut_down();
/// ```
pub struct DelayingQueue<T: QueueItem> {
    shared: Arc<Shared<T>>,
    admit_tx: Sender<WaitEntry<T::Key>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    admission_loop: Mutex<Option<JoinHandle<()>>>,
    shutdown_once: Once,
}

impl<T: QueueItem> DelayingQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// A capacity of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Returns an error if the admission thread cannot be spawned.
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        Self::with_heartbeat(capacity, DEFAULT_HEARTBEAT)
    }

    /// Create a queue with a custom admission-loop heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the admission thread cannot be spawned.
    pub fn with_heartbeat(capacity: usize, heartbeat: Duration) -> std::io::Result<Self> {
        let capacity = capacity.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                capacity,
                prepare: HashMap::new(),
                processing: HashSet::new(),
                dirty: HashMap::new(),
                visible: VecDeque::new(),
                shutting_down: false,
            }),
            visible_cv: Condvar::new(),
            capacity_cv: Condvar::new(),
        });

        let (admit_tx, admit_rx) = bounded(ADMISSION_BUFFER);
        let (stop_tx, stop_rx) = bounded(1);

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("queue-admission".into())
            .spawn(move || run_admission_loop(loop_shared, admit_rx, stop_rx, heartbeat))?;

        debug!(capacity, heartbeat_ms = heartbeat.as_millis() as u64, "delaying queue created");

        Ok(Self {
            shared,
            admit_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            admission_loop: Mutex::new(Some(handle)),
            shutdown_once: Once::new(),
        })
    }

    /// Add an item that is ready immediately, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] if the queue is (or starts) shutting down.
    pub fn add(&self, item: T) -> Result<(), QueueError> {
        self.insert(item, Duration::ZERO, true, true)
    }

    /// Add an item that becomes visible after `delay`, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] if the queue is (or starts) shutting down.
    pub fn add_after(&self, item: T, delay: Duration) -> Result<(), QueueError> {
        self.insert(item, delay, true, true)
    }

    /// Schedule another run of an item that is currently checked out.
    ///
    /// Behaves like [`add_after`](Self::add_after), except that a newer
    /// arrival already pending for the key keeps its payload; only the
    /// earlier ready time is taken.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] if the queue is (or starts) shutting down.
    pub fn requeue_after(&self, item: T, delay: Duration) -> Result<(), QueueError> {
        self.insert(item, delay, true, false)
    }

    /// Non-blocking [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] instead of waiting for capacity.
    pub fn try_add(&self, item: T) -> Result<(), QueueError> {
        self.insert(item, Duration::ZERO, false, true)
    }

    /// Non-blocking [`add_after`](Self::add_after).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] instead of waiting for capacity.
    pub fn try_add_after(&self, item: T, delay: Duration) -> Result<(), QueueError> {
        self.insert(item, delay, false, true)
    }

    fn insert(
        &self,
        item: T,
        delay: Duration,
        block: bool,
        replace: bool,
    ) -> Result<(), QueueError> {
        let key = item.key();
        let mut guard = self.shared.state.lock();
        let mut item = Some(item);

        let scheduled = loop {
            let state = &mut *guard;
            if state.shutting_down {
                return Err(QueueError::ShuttingDown);
            }
            let Some(next) = item.take() else {
                return Ok(());
            };
            let now = Instant::now();
            let ready_at = now + delay.min(MAX_DELAY);

            // In flight: remember the arrival, requeued by `done`.
            if state.processing.contains(&key) {
                match state.dirty.get_mut(&key) {
                    Some(pending) => {
                        pending.merge(next, ready_at, replace);
                    }
                    None => {
                        state.dirty.insert(
                            key.clone(),
                            Pending { item: next, ready_at, visible: false },
                        );
                    }
                }
                debug!(key = ?key, "marked dirty while processing");
                break None;
            }

            if let Some(pending) = state.prepare.get_mut(&key) {
                let earlier = pending.merge(next, ready_at, replace);
                if !earlier || pending.visible {
                    break None;
                }
                if ready_at <= now {
                    pending.visible = true;
                    state.visible.push_back(key.clone());
                    self.shared.visible_cv.notify_one();
                    break None;
                }
                break Some(WaitEntry { key: key.clone(), ready_at });
            }

            if state.len() >= state.capacity {
                if !block {
                    return Err(QueueError::Full);
                }
                item = Some(next);
                self.shared.capacity_cv.wait(&mut guard);
                continue;
            }

            let pending = Pending { item: next, ready_at, visible: false };
            if ready_at <= now {
                state.make_visible(key.clone(), pending);
                self.shared.visible_cv.notify_one();
                break None;
            }
            state.prepare.insert(key.clone(), pending);
            break Some(WaitEntry { key: key.clone(), ready_at });
        };
        drop(guard);

        if let Some(entry) = scheduled {
            self.schedule(entry);
        }
        Ok(())
    }

    /// Hand a waiting entry to the admission loop. Must be called without the state lock.
    fn schedule(&self, entry: WaitEntry<T::Key>) {
        if self.admit_tx.send(entry).is_err() {
            debug!("admission loop stopped; delayed entry dropped");
        }
    }

    /// Block until an item is visible, then check it out.
    ///
    /// Returns `None` once the queue is shutting down and nothing is visible.
    pub fn get(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            while let Some(key) = state.visible.pop_front() {
                if let Some(pending) = state.prepare.remove(&key) {
                    state.dirty.remove(&key);
                    state.processing.insert(key);
                    return Some(pending.item);
                }
            }
            if state.shutting_down {
                return None;
            }
            self.shared.visible_cv.wait(&mut state);
        }
    }

    /// Release a checked-out item.
    ///
    /// If a duplicate arrived while it was processing, the newest arrival is
    /// requeued with its own ready time; otherwise the key is forgotten.
    /// After shutdown the arrival becomes visible at once, regardless of its delay.
    pub fn done(&self, item: &T) {
        let key = item.key();
        let mut state = self.shared.state.lock();
        if !state.processing.remove(&key) {
            return;
        }

        let mut scheduled = None;
        if let Some(pending) = state.dirty.remove(&key) {
            // The admission loop is gone after shutdown; surface the
            // follow-up directly so it can still be drained.
            if state.shutting_down || pending.ready_at <= Instant::now() {
                state.make_visible(key, pending);
                self.shared.visible_cv.notify_one();
            } else {
                scheduled = Some(WaitEntry { key: key.clone(), ready_at: pending.ready_at });
                state.prepare.insert(key, pending);
            }
        }
        drop(state);
        self.shared.capacity_cv.notify_all();

        if let Some(entry) = scheduled {
            self.schedule(entry);
        }
    }

    /// Number of items admitted or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().len()
    }

    /// Whether no items are admitted or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items admitted or in flight.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Number of items currently checked out.
    #[must_use]
    pub fn processing_len(&self) -> usize {
        self.shared.state.lock().processing.len()
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Stop accepting items and wake every blocked caller. Idempotent.
    pub fn shut_down(&self) {
        self.shutdown_once.call_once(|| {
            self.shared.state.lock().shutting_down = true;
            self.shared.visible_cv.notify_all();
            self.shared.capacity_cv.notify_all();

            self.stop_tx.lock().take();
            if let Some(handle) = self.admission_loop.lock().take() {
                if handle.join().is_err() {
                    tracing::warn!("admission loop panicked");
                }
            }
            info!("delaying queue shut down");
        });
    }

    /// Shut down and block until every checked-out item is marked done.
    pub fn shut_down_with_drain(&self) {
        self.shut_down();
        let mut state = self.shared.state.lock();
        while !state.processing.is_empty() {
            self.shared.capacity_cv.wait(&mut state);
        }
    }

    /// Drop every entry that has not been checked out. Returns how many were dropped.
    pub fn discard_pending(&self) -> usize {
        let mut state = self.shared.state.lock();
        let dropped = state.prepare.len() + state.dirty.len();
        state.prepare.clear();
        state.dirty.clear();
        state.visible.clear();
        drop(state);
        self.shared.capacity_cv.notify_all();
        dropped
    }
}

impl<T: QueueItem> Drop for DelayingQueue<T> {
    fn drop(&mut self) {
        // Stop the admission loop without joining it.
        self.stop_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        key: &'static str,
        rev: u32,
    }

    impl QueueItem for Item {
        type Key = &'static str;

        fn key(&self) -> Self::Key {
            self.key
        }

        fn supersedes(&self, pending: &Self) -> bool {
            self.rev >= pending.rev
        }
    }

    fn item(key: &'static str, rev: u32) -> Item {
        Item { key, rev }
    }

    #[test]
    fn test_add_get_done() {
        let q = DelayingQueue::new(10).unwrap();
        q.add(item("a", 1)).unwrap();
        assert_eq!(q.len(), 1);

        let got = q.get().unwrap();
        assert_eq!(got, item("a", 1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.processing_len(), 1);

        q.done(&got);
        assert!(q.is_empty());
    }

    #[test]
    fn test_duplicate_pending_merges_payload() {
        let q = DelayingQueue::new(10).unwrap();
        q.add(item("a", 1)).unwrap();
        q.add(item("a", 3)).unwrap();
        q.add(item("a", 2)).unwrap();
        assert_eq!(q.len(), 1);

        // rev 2 does not supersede rev 3
        assert_eq!(q.get().unwrap(), item("a", 3));
    }

    #[test]
    fn test_earlier_ready_time_wins() {
        let q = DelayingQueue::new(10).unwrap();
        q.add_after(item("a", 1), Duration::from_secs(60)).unwrap();
        q.add(item("a", 2)).unwrap();

        let start = Instant::now();
        assert_eq!(q.get().unwrap(), item("a", 2));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_later_duplicate_keeps_earlier_ready_time() {
        let q = DelayingQueue::new(10).unwrap();
        q.add(item("a", 1)).unwrap();
        q.add_after(item("a", 2), Duration::from_secs(60)).unwrap();

        let start = Instant::now();
        assert_eq!(q.get().unwrap(), item("a", 2));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_delay_is_honored() {
        let q = DelayingQueue::new(10).unwrap();
        let start = Instant::now();
        q.add_after(item("a", 1), Duration::from_millis(100)).unwrap();
        let got = q.get().unwrap();
        assert_eq!(got.key, "a");
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_dirty_while_processing_requeues_once() {
        let q = DelayingQueue::new(10).unwrap();
        q.add(item("a", 1)).unwrap();
        let first = q.get().unwrap();

        q.add(item("a", 2)).unwrap();
        q.add(item("a", 3)).unwrap();
        assert_eq!(q.len(), 1);

        q.done(&first);
        assert_eq!(q.len(), 1);
        let second = q.get().unwrap();
        assert_eq!(second, item("a", 3));

        q.done(&second);
        assert!(q.is_empty());
    }

    #[test]
    fn test_delayed_dirty_keeps_its_delay() {
        let q = DelayingQueue::new(10).unwrap();
        q.add(item("a", 1)).unwrap();
        let first = q.get().unwrap();

        let start = Instant::now();
        q.add_after(item("a", 2), Duration::from_millis(80)).unwrap();
        q.done(&first);

        let second = q.get().unwrap();
        assert_eq!(second.rev, 2);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_requeue_keeps_newer_pending_payload() {
        let q = DelayingQueue::new(10).unwrap();
        q.add(item("a", 3)).unwrap();
        let first = q.get().unwrap();

        // rev 3 would supersede rev 2 under add_after
        q.add(item("a", 2)).unwrap();
        q.requeue_after(first.clone(), Duration::from_secs(60)).unwrap();
        q.done(&first);

        // the fresh arrival was ready now, so no delay applies
        let start = Instant::now();
        let second = q.get().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(second, item("a", 2));
    }

    #[test]
    fn test_try_add_reports_full() {
        let q = DelayingQueue::new(2).unwrap();
        q.try_add(item("a", 1)).unwrap();
        q.try_add(item("b", 1)).unwrap();
        assert_eq!(q.try_add(item("c", 1)), Err(QueueError::Full));
        // duplicates never need capacity
        assert_eq!(q.try_add(item("a", 2)), Ok(()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_blocking_add_waits_for_done() {
        let q = Arc::new(DelayingQueue::new(1).unwrap());
        q.add(item("a", 1)).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                q.add(item("b", 1)).unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(q.len(), 1);

        let a = q.get().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        q.done(&a);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().unwrap().key, "b");
    }

    #[test]
    fn test_shut_down_unblocks_get() {
        let q = Arc::new(DelayingQueue::<Item>::new(4).unwrap());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.get())
        };
        thread::sleep(Duration::from_millis(50));
        q.shut_down();
        assert!(consumer.join().unwrap().is_none());
        assert_eq!(q.add(item("a", 1)), Err(QueueError::ShuttingDown));
    }

    #[test]
    fn test_get_drains_visible_items_after_shutdown() {
        let q = DelayingQueue::new(4).unwrap();
        q.add(item("a", 1)).unwrap();
        q.shut_down();
        assert_eq!(q.get().unwrap().key, "a");
        assert!(q.get().is_none());
    }

    #[test]
    fn test_follow_up_survives_shutdown() {
        let q = DelayingQueue::new(4).unwrap();
        q.add(item("a", 1)).unwrap();
        q.add(item("b", 1)).unwrap();
        let first = q.get().unwrap();
        assert_eq!(first.key, "a");

        q.add(item("a", 2)).unwrap();
        q.shut_down();
        q.done(&first);

        let mut drained = Vec::new();
        while let Some(next) = q.get() {
            q.done(&next);
            drained.push(next);
        }
        assert_eq!(drained, vec![item("b", 1), item("a", 2)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_delayed_follow_up_is_visible_after_shutdown() {
        let q = DelayingQueue::new(4).unwrap();
        q.add(item("a", 1)).unwrap();
        let first = q.get().unwrap();
        q.add_after(item("a", 2), Duration::from_secs(60)).unwrap();

        q.shut_down();
        q.done(&first);
        assert_eq!(q.get(), Some(item("a", 2)));
    }

    #[test]
    fn test_shut_down_is_idempotent_under_concurrency() {
        let q = Arc::new(DelayingQueue::<Item>::new(4).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.shut_down())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        q.shut_down();
        assert!(q.is_shutting_down());
    }

    #[test]
    fn test_shut_down_with_drain_waits_for_processing() {
        let q = Arc::new(DelayingQueue::new(4).unwrap());
        q.add(item("a", 1)).unwrap();
        let a = q.get().unwrap();

        let (tx, rx) = mpsc::channel();
        let drainer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                q.shut_down_with_drain();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        q.done(&a);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drainer.join().unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_discard_pending() {
        let q = DelayingQueue::new(4).unwrap();
        q.add(item("a", 1)).unwrap();
        q.add_after(item("b", 1), Duration::from_secs(60)).unwrap();
        let a = q.get().unwrap();
        q.add(item("c", 1)).unwrap();

        q.shut_down();
        assert_eq!(q.discard_pending(), 2);
        assert_eq!(q.len(), 1);
        q.done(&a);
        assert!(q.is_empty());
    }
}
