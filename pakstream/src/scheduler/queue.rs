//! Priority queue for fetch scheduling.
//!
//! Fetches are ordered by priority (higher values first), then by enqueue
//! time (FIFO within the same priority level). Sub-ranges submitted together
//! by one split read share a sequence number; among those the tie is broken
//! by ascending (pak, start offset), so dispatch order is deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::policy::Priority;
use crate::manifest::PakId;
use crate::range::ChunkRange;

// ============================================================================
// Queued Fetch
// ============================================================================

/// A fetch request waiting to be dispatched.
#[derive(Debug, Clone)]
pub struct QueuedFetch {
    /// Package the bytes belong to.
    pub pak: PakId,

    /// Byte range to fetch.
    pub range: ChunkRange,

    /// Scheduling priority (higher = dispatched sooner).
    pub priority: Priority,

    /// Sequence number for FIFO ordering; shared by a batch submitted
    /// together.
    sequence: u64,

    /// When the fetch was enqueued (for wait time telemetry).
    pub enqueued_at: Instant,
}

impl QueuedFetch {
    /// Returns how long this fetch has been waiting in the queue.
    pub fn wait_time(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }

    /// Sequence number assigned at enqueue time.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

// Ordering for BinaryHeap: higher priority first, then lower sequence
// (older) first, then ascending (pak, start) within a batch.
impl PartialEq for QueuedFetch {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
            && self.sequence == other.sequence
            && self.pak == other.pak
            && self.range.start == other.range.start
    }
}

impl Eq for QueuedFetch {}

impl PartialOrd for QueuedFetch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFetch {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum, so priority compares naturally while
        // sequence and (pak, start) compare reversed: older batches and lower
        // offsets must come out first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.pak.cmp(&self.pak))
            .then_with(|| other.range.start.cmp(&self.range.start))
    }
}

// ============================================================================
// Fetch Queue
// ============================================================================

/// Priority queue of pending fetches.
///
/// Dispatch order is priority descending (BLOCKING before PREFETCH), then
/// enqueue order ascending, then (pak, start) ascending within a batch.
///
/// The queue is not thread-safe; the fetch daemon owns it exclusively.
/// Sequence numbers are issued by the queue itself so that tests and the
/// daemon get identical, reproducible dispatch orders.
#[derive(Debug, Default)]
pub struct FetchQueue {
    heap: BinaryHeap<QueuedFetch>,
    sequences: u64,
}

impl FetchQueue {
    /// Creates a new empty fetch queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a sequence number for a batch of related fetches.
    ///
    /// All sub-ranges produced by splitting one read should be pushed with
    /// the same sequence so they dispatch in ascending offset order.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequences;
        self.sequences += 1;
        sequence
    }

    /// Adds a fetch to the queue under the given batch sequence.
    pub fn push(&mut self, pak: PakId, range: ChunkRange, priority: Priority, sequence: u64) {
        self.heap.push(QueuedFetch {
            pak,
            range,
            priority,
            sequence,
            enqueued_at: Instant::now(),
        });
    }

    /// Removes and returns the highest-priority fetch.
    ///
    /// Returns `None` if the queue is empty.
    pub fn pop(&mut self) -> Option<QueuedFetch> {
        self.heap.pop()
    }

    /// Returns a reference to the highest-priority fetch without removing it.
    pub fn peek(&self) -> Option<&QueuedFetch> {
        self.heap.peek()
    }

    /// Returns the number of queued fetches.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes all queued fetches.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Removes all queued fetches for a package.
    ///
    /// Returns the removed fetches (used to fail their waiters when the
    /// package is unregistered).
    pub fn remove_pak(&mut self, pak: &PakId) -> Vec<QueuedFetch> {
        let mut removed = Vec::new();
        let remaining: Vec<_> = self
            .heap
            .drain()
            .filter_map(|fetch| {
                if fetch.pak == *pak {
                    removed.push(fetch);
                    None
                } else {
                    Some(fetch)
                }
            })
            .collect();
        self.heap = BinaryHeap::from(remaining);
        removed
    }

    /// Returns an iterator over fetches (in arbitrary order, not priority
    /// order). For priority-ordered iteration, repeatedly call `pop()`.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedFetch> {
        self.heap.iter()
    }

    /// Returns the number of fetches at each priority level.
    pub fn priority_counts(&self) -> std::collections::HashMap<Priority, usize> {
        let mut counts = std::collections::HashMap::new();
        for fetch in self.heap.iter() {
            *counts.entry(fetch.priority).or_insert(0) += 1;
        }
        counts
    }
}

// ============================================================================
// Tests
// ============================================================================
