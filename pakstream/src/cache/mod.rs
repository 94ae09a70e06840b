//! Local chunk cache backed by the filesystem.
//!
//! The cache persists fetched byte ranges as chunk files on disk so that
//! subsequent reads and process restarts can be served without refetching.
//! One [`ChunkStore`] owns a cache directory; each resident range of a
//! package is a single file named after its pak, offset, and length.
//!
//! # Design Principles
//!
//! - **Merge on put**: adjacent and overlapping ranges collapse into one
//!   entry, so resident spans never touch and a fully streamed package is
//!   exactly one file
//! - **Whole-range eviction**: the LRU evictor removes entries wholesale,
//!   never trimming a file in place
//! - **Pins protect readers**: a [`ReadPin`] keeps every overlapping entry
//!   out of the evictor for as long as a read needs the bytes
//! - **No I/O under locks**: index locks are held to plan and commit;
//!   file reads and writes happen between those critical sections
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/
//!   island_textures_0_4096.chunk      # bytes [0, 4096) of island_textures
//!   island_textures_8192_1024.chunk   # bytes [8192, 9216)
//!   residency.json                    # index snapshot for warm restarts
//! ```

pub mod layout;
pub mod snapshot;
pub mod store;
pub mod verify;

pub use snapshot::{PakSnapshot, SnapshotFile};
pub use store::{ChunkStore, ReadPin};
pub use verify::{bytes_digest, file_digest, verify_file_digest};

use std::fmt;

use thiserror::Error;

use crate::range::ChunkRange;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error while reading or writing chunk files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The residency snapshot could not be encoded or decoded.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A file's content does not hash to the expected digest.
    #[error("Digest mismatch for {file}: expected {expected}, got {actual}")]
    DigestMismatch {
        file: String,
        expected: String,
        actual: String,
    },
}

/// Result of storing a range in the cache.
///
/// Putting a range may absorb previously resident neighbours; the outcome
/// reports the final merged extent so callers can see what became resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// The resident range after merging with any adjacent entries.
    pub merged_range: ChunkRange,
    /// Number of pre-existing entries absorbed by the merge.
    pub merged_entries: usize,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Number of entries removed.
    pub entries_removed: usize,
    /// Total bytes freed.
    pub bytes_freed: u64,
}

impl fmt::Display for EvictionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "evicted {} entries, freed {} bytes",
            self.entries_removed, self.bytes_freed
        )
    }
}

/// Point-in-time view of cache occupancy.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Bytes currently resident across all packages.
    pub resident_bytes: u64,
    /// Configured capacity in bytes.
    pub capacity_bytes: u64,
    /// Number of packages with at least one resident range.
    pub package_count: usize,
    /// Number of chunk entries across all packages.
    pub entry_count: usize,
    /// Number of read pins currently held.
    pub active_pins: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} bytes across {} packages ({} entries, {} pins)",
            self.resident_bytes,
            self.capacity_bytes,
            self.package_count,
            self.entry_count,
            self.active_pins
        )
    }
}
