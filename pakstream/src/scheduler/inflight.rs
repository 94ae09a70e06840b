//! In-flight fetch tracking and request deduplication.
//!
//! At most one outstanding fetch may cover any given byte. Before enqueuing
//! work for a range, the daemon consults this table: parts already being
//! fetched attach the caller as a waiter on the existing operation, and only
//! the remainder becomes new fetch entries. Waiters are broadcast receivers,
//! so every watcher of a fetch observes exactly one terminal outcome.
//!
//! The table itself does no locking beyond its map; the fetch daemon is the
//! only writer that both queries and inserts, which makes the
//! query-then-insert sequence atomic with respect to other submissions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::manifest::PakId;
use crate::range::{ChunkRange, ResidencySet};

/// Broadcast channel capacity per fetch entry. Each entry sends exactly one
/// terminal outcome, so one slot would do; a little headroom costs nothing.
const OUTCOME_CHANNEL_CAPACITY: usize = 4;

// ============================================================================
// Outcomes
// ============================================================================

/// Terminal outcome of an in-flight fetch, broadcast to every waiter.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The bytes are resident in the cache (and the package passed any
    /// verification that became due). Waiters re-read from the store.
    Stored,

    /// The package failed digest verification; its cache was invalidated
    /// and one more fetch attempt is allowed. Waiters should resubmit.
    IntegrityRetry,

    /// The fetch failed terminally.
    Failed(FetchFailure),
}

/// Terminal failure reasons, cloneable so they can fan out to all waiters.
#[derive(Debug, Clone)]
pub enum FetchFailure {
    /// Transport failure after exhausting retries.
    Transport { attempts: u32, detail: String },

    /// The fetched bytes could not be written to the local cache.
    Cache { detail: String },

    /// The package failed digest verification twice.
    Integrity,

    /// The package was unregistered while the fetch was queued or running.
    Unregistered,

    /// The engine is shutting down.
    ShuttingDown,
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { attempts, detail } => {
                write!(f, "transport failure after {attempts} attempts: {detail}")
            }
            Self::Cache { detail } => write!(f, "cache write failure: {detail}"),
            Self::Integrity => write!(f, "digest verification failed"),
            Self::Unregistered => write!(f, "package unregistered"),
            Self::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

// ============================================================================
// Fetch Entry
// ============================================================================

/// One outstanding fetch operation.
///
/// Waiters subscribe to the entry's broadcast channel; the fetch task sends
/// exactly one [`FetchOutcome`] when it settles. Dropping a receiver detaches
/// the waiter without affecting the fetch.
#[derive(Debug)]
pub struct FetchEntry {
    /// Package being fetched.
    pub pak: PakId,

    /// Byte range this operation covers.
    pub range: ChunkRange,

    notify: broadcast::Sender<FetchOutcome>,

    /// Set when the package is unregistered mid-flight; the fetch task
    /// drops the bytes instead of storing them.
    discard: AtomicBool,
}

impl FetchEntry {
    fn new(pak: PakId, range: ChunkRange) -> Arc<Self> {
        let (notify, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Arc::new(Self {
            pak,
            range,
            notify,
            discard: AtomicBool::new(false),
        })
    }

    /// Attach a waiter to this fetch.
    pub fn subscribe(&self) -> broadcast::Receiver<FetchOutcome> {
        self.notify.subscribe()
    }

    /// Number of waiters currently attached.
    ///
    /// Used to demote queued blocking fetches whose callers have all gone
    /// away (timed out or cancelled) before dispatch.
    pub fn waiter_count(&self) -> usize {
        self.notify.receiver_count()
    }

    /// Broadcast the terminal outcome. Returns the number of waiters that
    /// received it.
    pub fn complete(&self, outcome: FetchOutcome) -> usize {
        self.notify.send(outcome).unwrap_or(0)
    }

    /// Tell the fetch task to drop its bytes instead of storing them.
    pub fn mark_discard(&self) {
        self.discard.store(true, Ordering::Release);
    }

    /// Whether fetched bytes should be discarded.
    pub fn should_discard(&self) -> bool {
        self.discard.load(Ordering::Acquire)
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Result of deduplicating a request against in-flight fetches.
#[derive(Debug)]
pub struct Registration {
    /// One receiver per existing fetch that overlaps the request.
    pub receivers: Vec<broadcast::Receiver<FetchOutcome>>,

    /// Sub-ranges of the request no fetch covers yet, ascending. The caller
    /// must create entries and enqueue fetches for these.
    pub new_ranges: Vec<ChunkRange>,
}

// ============================================================================
// In-Flight Table
// ============================================================================

/// Table of outstanding fetches, keyed by package.
#[derive(Debug, Default)]
pub struct InFlightTable {
    paks: DashMap<PakId, Vec<Arc<FetchEntry>>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicate `range` against outstanding fetches.
    ///
    /// Every overlapping fetch contributes a receiver (the request rides
    /// along); the uncovered remainder comes back as `new_ranges`. An
    /// in-flight fetch is never split or re-scoped by a later request.
    pub fn register(&self, pak: &PakId, range: ChunkRange) -> Registration {
        if range.is_empty() {
            return Registration {
                receivers: Vec::new(),
                new_ranges: Vec::new(),
            };
        }

        let mut receivers = Vec::new();
        let mut covered = ResidencySet::new();
        if let Some(entries) = self.paks.get(pak) {
            for entry in entries.iter() {
                if entry.range.intersects(&range) {
                    receivers.push(entry.subscribe());
                    covered.insert(entry.range);
                }
            }
        }

        Registration {
            receivers,
            new_ranges: covered.missing_within(&range),
        }
    }

    /// Create and track a new fetch entry for a range nobody covers.
    ///
    /// The caller is responsible for ensuring the range does not overlap an
    /// existing entry (it holds between [`register`](Self::register) and
    /// this call because the daemon is the only writer).
    pub fn insert(&self, pak: &PakId, range: ChunkRange) -> Arc<FetchEntry> {
        let entry = FetchEntry::new(pak.clone(), range);
        self.paks
            .entry(pak.clone())
            .or_default()
            .push(Arc::clone(&entry));
        entry
    }

    /// Look up the entry covering exactly `range`.
    pub fn entry(&self, pak: &PakId, range: &ChunkRange) -> Option<Arc<FetchEntry>> {
        self.paks.get(pak)?.iter().find(|e| e.range == *range).cloned()
    }

    /// Stop tracking the entry for exactly `range`.
    ///
    /// Called by the fetch task before it broadcasts an outcome, so that a
    /// request arriving after the broadcast finds the cache instead of a
    /// settled fetch.
    pub fn remove(&self, pak: &PakId, range: &ChunkRange) -> Option<Arc<FetchEntry>> {
        let removed = {
            let mut entries = self.paks.get_mut(pak)?;
            let index = entries.iter().position(|e| e.range == *range)?;
            Some(entries.swap_remove(index))
        };
        self.paks.remove_if(pak, |_, entries| entries.is_empty());
        removed
    }

    /// Stop tracking every entry for a package (unregistration).
    pub fn drain_pak(&self, pak: &PakId) -> Vec<Arc<FetchEntry>> {
        match self.paks.remove(pak) {
            Some((_, entries)) => entries,
            None => Vec::new(),
        }
    }

    /// Stop tracking every entry across all packages (shutdown).
    pub fn drain_all(&self) -> Vec<Arc<FetchEntry>> {
        let paks: Vec<PakId> = self.paks.iter().map(|item| item.key().clone()).collect();
        paks.iter().flat_map(|pak| self.drain_pak(pak)).collect()
    }

    /// Number of outstanding fetches across all packages.
    pub fn len(&self) -> usize {
        self.paks.iter().map(|item| item.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
