//! Fetch scheduling: priorities, queueing, deduplication, dispatch.
//!
//! Every chunk fetch in the engine passes through one [`FetchDaemon`]. The
//! daemon owns a priority [`FetchQueue`] (blocking reads ahead of prefetch,
//! FIFO within a class) and an [`InFlightTable`] that guarantees at most one
//! outstanding fetch per byte. Callers interact only through the command
//! channel returned by [`FetchDaemon::new`].
//!
//! # Design Principles
//!
//! - **Two priority classes**: a read somebody is waiting on always beats
//!   speculative prefetch; within a class, arrival order wins.
//! - **Byte-level deduplication**: overlapping requests attach to the fetch
//!   already covering them and only the remainder spawns new work.
//! - **Bounded concurrency**: at most `max_concurrent_fetches` transfers run
//!   at once, and a dispatched fetch is never preempted.

pub mod daemon;
pub mod inflight;
pub mod policy;
pub mod queue;

pub use daemon::{
    FetchCommand, FetchDaemon, FetchDaemonConfig, SubmitResult, DEFAULT_COMMAND_CHANNEL_CAPACITY,
    DEFAULT_MAX_CONCURRENT_FETCHES,
};
pub use inflight::{FetchEntry, FetchFailure, FetchOutcome, InFlightTable, Registration};
pub use policy::{Priority, PRIORITY_BLOCKING, PRIORITY_PREFETCH};
pub use queue::{FetchQueue, QueuedFetch};
