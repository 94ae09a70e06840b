//! Residency snapshot for fast warm restarts.
//!
//! On shutdown (and after verification transitions) the store writes a small
//! JSON index next to the chunk files recording which ranges were resident
//! and which packages had passed digest verification. On startup the chunk
//! files themselves are re-scanned as the authority; the snapshot only
//! contributes verified digests, and only for packages whose scanned spans
//! still match what the snapshot recorded. A package whose files changed
//! while the process was down is simply re-verified later.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheError;
use crate::manifest::PakId;
use crate::range::ChunkRange;

/// File name of the residency snapshot inside the cache directory.
pub const SNAPSHOT_FILE_NAME: &str = "residency.json";

/// Resolve the snapshot path for a cache directory.
pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE_NAME)
}

/// Recorded residency for a single package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PakSnapshot {
    /// Package identifier.
    pub name: PakId,

    /// Resident spans at the time the snapshot was taken.
    pub ranges: Vec<ChunkRange>,

    /// Digest the package body verified against, if verification passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_digest: Option<String>,
}

/// On-disk snapshot of cache residency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Pakstream version that wrote the snapshot (format may change).
    pub version: String,

    /// Per-package residency records.
    pub packages: Vec<PakSnapshot>,
}

impl SnapshotFile {
    /// Create a snapshot stamped with the current crate version.
    pub fn new(packages: Vec<PakSnapshot>) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            packages,
        }
    }

    /// Load the snapshot from a cache directory.
    ///
    /// Returns `None` if:
    /// - No snapshot file exists
    /// - The snapshot is corrupted
    /// - The snapshot was written by a different version
    ///
    /// All three cases fall back to the chunk-file scan; a missing or stale
    /// snapshot never blocks startup.
    pub async fn load(dir: &Path) -> Result<Option<Self>, CacheError> {
        let path = snapshot_path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let snapshot: SnapshotFile = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Ignoring corrupt residency snapshot");
                return Ok(None);
            }
        };

        if snapshot.version != crate::VERSION {
            debug!(
                snapshot_version = %snapshot.version,
                current_version = %crate::VERSION,
                "Ignoring residency snapshot from different version"
            );
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    /// Save the snapshot into a cache directory.
    ///
    /// Writes to a temp file and renames for atomicity, so a crash mid-write
    /// leaves either the old snapshot or none at all.
    pub async fn save(&self, dir: &Path) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(dir).await?;

        let path = snapshot_path(dir);
        let temp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(self)?;

        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(path = %path.display(), packages = self.packages.len(), "Saved residency snapshot");
        Ok(())
    }

    /// Look up the record for a package.
    pub fn package(&self, pak: &PakId) -> Option<&PakSnapshot> {
        self.packages.iter().find(|p| &p.name == pak)
    }

    /// Verified digest for a package, honoured only when the scanned spans
    /// match what the snapshot recorded.
    pub fn verified_digest_if_unchanged(
        &self,
        pak: &PakId,
        scanned: &[ChunkRange],
    ) -> Option<&str> {
        let record = self.package(pak)?;
        if record.ranges == scanned {
            record.verified_digest.as_deref()
        } else {
            None
        }
    }
}
