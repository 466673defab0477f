//! Delay heap and the admission loop that promotes due entries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver};
use tracing::debug;

use super::delaying::Shared;
use super::QueueItem;

/// A key waiting for its ready time.
#[derive(Debug, Clone)]
pub struct WaitEntry<K> {
    /// Identity of the waiting item; the payload stays in the prepare set.
    pub key: K,
    /// Instant after which the item may become visible.
    pub ready_at: Instant,
}

/// Heap slot ordered by ready time, FIFO among equal ready times.
struct Slot<K> {
    entry: WaitEntry<K>,
    seq: u64,
}

impl<K> PartialEq for Slot<K> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<K> Eq for Slot<K> {}

impl<K> PartialOrd for Slot<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Slot<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that BinaryHeap (a max-heap) yields the earliest entry.
        other
            .entry
            .ready_at
            .cmp(&self.entry.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of wait entries keyed by ready time.
pub(super) struct DelayHeap<K> {
    slots: BinaryHeap<Slot<K>>,
    next_seq: u64,
}

impl<K> DelayHeap<K> {
    pub(super) fn new() -> Self {
        Self {
            slots: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(super) fn push(&mut self, entry: WaitEntry<K>) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.slots.push(Slot { entry, seq });
    }

    /// Pop every entry whose ready time is at or before `now`.
    pub(super) fn pop_due(&mut self, now: Instant) -> Vec<WaitEntry<K>> {
        let mut due = Vec::new();
        while self
            .slots
            .peek()
            .is_some_and(|slot| slot.entry.ready_at <= now)
        {
            if let Some(slot) = self.slots.pop() {
                due.push(slot.entry);
            }
        }
        due
    }

    pub(super) fn next_ready_at(&self) -> Option<Instant> {
        self.slots.peek().map(|slot| slot.entry.ready_at)
    }

    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Background loop owning the delay heap.
///
/// Wakes on the earliest of: the next entry's ready time, a new admission,
/// or the heartbeat. Exits when `stop_rx` is signalled or disconnected.
pub(super) fn run_admission_loop<T: QueueItem>(
    shared: Arc<Shared<T>>,
    admit_rx: Receiver<WaitEntry<T::Key>>,
    stop_rx: Receiver<()>,
    heartbeat: Duration,
) {
    let mut heap = DelayHeap::new();

    loop {
        let now = Instant::now();
        let due = heap.pop_due(now);
        if !due.is_empty() {
            let promoted = shared.promote(due);
            debug!(promoted, waiting = heap.len(), "promoted delayed items");
        }

        let wait = heap
            .next_ready_at()
            .map_or(heartbeat, |at| at.saturating_duration_since(now).min(heartbeat));

        select! {
            recv(admit_rx) -> msg => match msg {
                Ok(entry) => {
                    heap.push(entry);
                    for entry in admit_rx.try_iter() {
                        heap.push(entry);
                    }
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
            default(wait) => {}
        }
    }

    debug!(abandoned = heap.len(), "admission loop exiting");
}
