//! Scheduling priority for fetch requests.
//!
//! Fetches come in two classes: blocking fetches have a caller waiting on
//! the bytes, prefetches fill the cache opportunistically. The scheduler
//! drains blocking work first and never preempts a fetch that has already
//! been dispatched.

// ============================================================================
// Priority Constants
// ============================================================================

/// Priority value for fetches a read is blocked on.
pub const PRIORITY_BLOCKING: i32 = 100;

/// Priority value for background prefetch work.
pub const PRIORITY_PREFETCH: i32 = 0;

// ============================================================================
// Priority
// ============================================================================

/// Fetch scheduling priority.
///
/// Fetches are queued by priority (higher values dispatch first), then FIFO
/// within the same priority level. This ensures reads that a caller is
/// blocked on are served before background streaming.
///
/// # Priority Levels
///
/// - [`Priority::BLOCKING`] (100): a read is waiting on these bytes
/// - [`Priority::PREFETCH`] (0): cache warming, nobody is waiting
///
/// # Example
///
/// ```
/// use pakstream::scheduler::Priority;
///
/// assert!(Priority::BLOCKING > Priority::PREFETCH);
/// assert!(Priority::BLOCKING.is_blocking());
/// assert!(!Priority::PREFETCH.is_blocking());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Fetches a read call is blocked on.
    ///
    /// These must be dispatched first - a caller is waiting for the bytes.
    pub const BLOCKING: Priority = Priority(PRIORITY_BLOCKING);

    /// Background prefetch work.
    ///
    /// Runs when no blocking fetch is queued. This is the default.
    pub const PREFETCH: Priority = Priority(PRIORITY_PREFETCH);

    /// Creates a new priority with the given value.
    ///
    /// Higher values mean higher priority.
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    /// Returns the numeric priority value.
    pub fn value(&self) -> i32 {
        self.0
    }

    /// Whether this priority counts as the blocking class.
    ///
    /// A queued blocking fetch whose waiters have all gone away is demoted
    /// to [`Priority::PREFETCH`] before dispatch.
    pub fn is_blocking(&self) -> bool {
        self.0 >= PRIORITY_BLOCKING
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::PREFETCH
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::BLOCKING => write!(f, "Blocking(100)"),
            Self::PREFETCH => write!(f, "Prefetch(0)"),
            Self(v) => write!(f, "Priority({})", v),
        }
    }
}
