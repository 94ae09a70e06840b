//! Disk-backed chunk store with merge-on-put and LRU eviction.
//!
//! [`ChunkStore`] owns the cache directory and an in-memory index of which
//! byte ranges of which packages are resident. The index is the authority
//! during a run; on startup it is rebuilt by scanning the chunk files, so
//! a crash can never leave the index claiming bytes the disk does not hold.
//!
//! # Concurrency
//!
//! Index access goes through short synchronous critical sections; file I/O
//! always happens outside them, so readers never wait on the disk to look
//! up residency. Writers for the same package are serialized by a per-pak
//! lock, which keeps the merge planning simple: between a writer's plan and
//! its commit, only readers' index repairs, eviction, or invalidation can
//! change the pak's entries, and the commit revalidates against those.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, trace, warn};

use super::layout::{chunk_file_path, parse_chunk_file_name};
use super::snapshot::{snapshot_path, PakSnapshot, SnapshotFile};
use super::{CacheError, CacheStats, EvictionReport, PutOutcome};
use crate::manifest::PakId;
use crate::range::{ChunkRange, ResidencySet};

// ============================================================================
// Index types
// ============================================================================

/// Index record for one resident chunk file.
#[derive(Debug, Clone, Copy)]
struct ChunkEntry {
    /// Length of the span in bytes (the span starts at the map key).
    len: u64,
    /// Logical clock tick of the last read or write touching this entry.
    last_access: u64,
}

/// Per-package index: span start -> entry.
///
/// Invariant: recorded spans never intersect or touch. Merge-on-put absorbs
/// any neighbour it could touch, so each entry maps to exactly one file.
#[derive(Debug, Default)]
struct PakChunks {
    entries: BTreeMap<u64, ChunkEntry>,
}

impl PakChunks {
    /// The single entry covering `range`, if one exists.
    ///
    /// Because spans never touch, a range is either inside one entry or it
    /// is not fully resident at all.
    fn covering_entry(&self, range: &ChunkRange) -> Option<ChunkRange> {
        let (&start, entry) = self.entries.range(..=range.start).next_back()?;
        let span = ChunkRange::new(start, start + entry.len);
        span.contains(range).then_some(span)
    }

    /// All entries that intersect or touch `range`, in ascending order.
    fn mergeable_with(&self, range: &ChunkRange) -> Vec<ChunkRange> {
        self.entries
            .range(..=range.end)
            .map(|(&start, entry)| ChunkRange::new(start, start + entry.len))
            .filter(|span| span.mergeable(range))
            .collect()
    }

    fn spans(&self) -> Vec<ChunkRange> {
        self.entries
            .iter()
            .map(|(&start, entry)| ChunkRange::new(start, start + entry.len))
            .collect()
    }
}

/// A pinned byte range, exempt from eviction.
#[derive(Debug)]
struct ActivePin {
    id: u64,
    pak: PakId,
    range: ChunkRange,
}

/// RAII guard that protects a byte range from eviction.
///
/// Held by readers across the whole read, including any fetches needed to
/// fill the range. Dropping the pin releases the protection.
#[derive(Debug)]
pub struct ReadPin {
    pins: Arc<Mutex<Vec<ActivePin>>>,
    id: u64,
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.pins.lock().retain(|pin| pin.id != self.id);
    }
}

// ============================================================================
// ChunkStore
// ============================================================================

/// Disk-backed store of fetched package ranges.
///
/// # Design
///
/// - **One file per span**: each resident range is a single chunk file named
///   after its pak, start offset, and length
/// - **Merge on put**: storing a range absorbs every entry it touches, so a
///   fully streamed package collapses into one file
/// - **LRU eviction**: when over the byte budget, least-recently-used spans
///   are removed wholesale, skipping anything pinned by an active read
/// - **Warm restart**: opening a directory re-scans the chunk files and
///   seeds recency from file modification times
#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
    capacity: AtomicU64,
    total_bytes: AtomicU64,
    paks: DashMap<PakId, PakChunks>,
    /// Serializes writers per package. Readers never take these.
    put_locks: DashMap<PakId, Arc<tokio::sync::Mutex<()>>>,
    pins: Arc<Mutex<Vec<ActivePin>>>,
    /// Digests that whole packages have verified against.
    verified: DashMap<PakId, String>,
    /// Logical clock driving LRU ordering.
    clock: AtomicU64,
    pin_ids: AtomicU64,
    temp_ids: AtomicU64,
}

impl ChunkStore {
    /// Open (or create) a chunk store in `dir`.
    ///
    /// Scans the directory for chunk files and rebuilds the residency index
    /// from them. Files left behind by a crash mid-merge (a merged file plus
    /// the pieces it absorbed) are resolved in favour of the largest span;
    /// truncated files are removed. Recency is seeded from modification
    /// times so eviction order survives a restart.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created or read.
    pub async fn open(dir: impl Into<PathBuf>, capacity_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut scanned: Vec<(PakId, ChunkRange, SystemTime, PathBuf)> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if file_name.ends_with(".tmp") {
                debug!(file = file_name, "Removing leftover temp file");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }

            let Some((pak, range)) = parse_chunk_file_name(file_name) else {
                continue;
            };

            let metadata = entry.metadata().await?;
            if metadata.len() != range.len() {
                warn!(
                    file = file_name,
                    expected_bytes = range.len(),
                    actual_bytes = metadata.len(),
                    "Removing chunk file with mismatched length"
                );
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }

            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            scanned.push((pak, range, mtime, path));
        }

        // Resolve crash leftovers: a merged file always spans more than the
        // pieces it absorbed, so keep larger spans and drop anything that
        // intersects or touches an already accepted span of the same pak.
        scanned.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        let mut accepted: Vec<(PakId, ChunkRange, SystemTime)> = Vec::with_capacity(scanned.len());
        let mut accepted_spans: HashMap<PakId, Vec<ChunkRange>> = HashMap::new();
        for (pak, range, mtime, path) in scanned {
            let spans = accepted_spans.entry(pak.clone()).or_default();
            if spans.iter().any(|span| span.mergeable(&range)) {
                debug!(pak = %pak, range = %range, "Removing superseded chunk file");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            spans.push(range);
            accepted.push((pak, range, mtime));
        }

        let store = Self {
            dir,
            capacity: AtomicU64::new(capacity_bytes),
            total_bytes: AtomicU64::new(0),
            paks: DashMap::new(),
            put_locks: DashMap::new(),
            pins: Arc::new(Mutex::new(Vec::new())),
            verified: DashMap::new(),
            clock: AtomicU64::new(0),
            pin_ids: AtomicU64::new(0),
            temp_ids: AtomicU64::new(0),
        };

        // Oldest files get the lowest recency ticks.
        accepted.sort_by_key(|(_, _, mtime)| *mtime);
        let mut total = 0u64;
        for (pak, range, _) in accepted {
            let tick = store.clock.fetch_add(1, Ordering::Relaxed);
            store.paks.entry(pak).or_default().entries.insert(
                range.start,
                ChunkEntry {
                    len: range.len(),
                    last_access: tick,
                },
            );
            total += range.len();
        }
        store.total_bytes.store(total, Ordering::Relaxed);

        // The snapshot only contributes verified digests, and only for
        // packages whose files did not change while the process was down.
        if let Some(snapshot) = SnapshotFile::load(&store.dir).await? {
            for record in &snapshot.packages {
                let spans = store.residency(&record.name);
                if let Some(digest) = snapshot.verified_digest_if_unchanged(&record.name, &spans) {
                    store.verified.insert(record.name.clone(), digest.to_string());
                }
            }
        }

        info!(
            dir = %store.dir.display(),
            capacity_bytes,
            resident_bytes = total,
            packages = store.paks.len(),
            "Opened chunk cache"
        );
        Ok(store)
    }

    /// Cache directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configured byte budget.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Change the byte budget. Does not evict; call
    /// [`evict_if_over_capacity`](Self::evict_if_over_capacity) to shrink.
    pub fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes, Ordering::Relaxed);
    }

    /// Bytes currently resident across all packages.
    pub fn resident_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Residency queries
    // ========================================================================

    /// Resident spans for a package, ascending.
    pub fn residency(&self, pak: &PakId) -> Vec<ChunkRange> {
        self.paks
            .get(pak)
            .map(|chunks| chunks.spans())
            .unwrap_or_default()
    }

    /// Resident spans for a package as a [`ResidencySet`].
    pub fn residency_set(&self, pak: &PakId) -> ResidencySet {
        ResidencySet::from_ranges(self.residency(pak))
    }

    /// Sub-ranges of `range` that are not resident, ascending.
    pub fn missing_within(&self, pak: &PakId, range: &ChunkRange) -> Vec<ChunkRange> {
        self.residency_set(pak).missing_within(range)
    }

    /// Whether `range` is fully resident.
    pub fn contains(&self, pak: &PakId, range: &ChunkRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.paks
            .get(pak)
            .map(|chunks| chunks.covering_entry(range).is_some())
            .unwrap_or(false)
    }

    /// Whether the whole package body `[0, total_length)` is resident.
    pub fn is_fully_resident(&self, pak: &PakId, total_length: u64) -> bool {
        if total_length == 0 {
            return true;
        }
        self.contains(pak, &ChunkRange::new(0, total_length))
    }

    /// Path of the package's single chunk file, if its residency has
    /// collapsed into exactly one span. Used for whole-package verification.
    pub fn single_entry_path(&self, pak: &PakId) -> Option<(ChunkRange, PathBuf)> {
        let chunks = self.paks.get(pak)?;
        if chunks.entries.len() != 1 {
            return None;
        }
        let (&start, entry) = chunks.entries.iter().next()?;
        let span = ChunkRange::new(start, start + entry.len);
        Some((span, chunk_file_path(&self.dir, pak, &span)))
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    /// Pin a byte range against eviction for the lifetime of the guard.
    pub fn pin(&self, pak: &PakId, range: ChunkRange) -> ReadPin {
        let id = self.pin_ids.fetch_add(1, Ordering::Relaxed);
        self.pins.lock().push(ActivePin {
            id,
            pak: pak.clone(),
            range,
        });
        ReadPin {
            pins: Arc::clone(&self.pins),
            id,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read `range` from the cache.
    ///
    /// Returns `Ok(None)` when the range is not fully resident. A resident
    /// range is always served from a single chunk file; if that file turns
    /// out to be missing or truncated, the index entry is dropped and the
    /// call reports a miss so the caller can refetch.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] for I/O failures other than a missing file.
    pub async fn get(&self, pak: &PakId, range: ChunkRange) -> Result<Option<Bytes>, CacheError> {
        if range.is_empty() {
            return Ok(Some(Bytes::new()));
        }

        let entry_range = {
            let Some(mut chunks) = self.paks.get_mut(pak) else {
                return Ok(None);
            };
            let Some(entry_range) = chunks.covering_entry(&range) else {
                return Ok(None);
            };
            let tick = self.clock.fetch_add(1, Ordering::Relaxed);
            if let Some(entry) = chunks.entries.get_mut(&entry_range.start) {
                entry.last_access = tick;
            }
            entry_range
        };

        let path = chunk_file_path(&self.dir, pak, &entry_range);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(pak = %pak, entry = %entry_range, "Chunk file missing, dropping index entry");
                self.remove_entry_if_current(pak, &entry_range);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let mut file = file;
        file.seek(SeekFrom::Start(range.start - entry_range.start))
            .await?;
        let mut buf = Vec::with_capacity(range.len() as usize);
        let read = file.take(range.len()).read_to_end(&mut buf).await?;
        if (read as u64) < range.len() {
            warn!(
                pak = %pak,
                entry = %entry_range,
                wanted = range.len(),
                got = read,
                "Chunk file truncated, dropping index entry"
            );
            self.remove_entry_if_current(pak, &entry_range);
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        trace!(pak = %pak, range = %range, "Cache hit");
        Ok(Some(Bytes::from(buf)))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store `bytes` as the content of `range`, merging with any resident
    /// neighbours, then evict if the store went over its budget.
    ///
    /// If the range is already covered this is a no-op that refreshes the
    /// covering entry's recency. Otherwise the new bytes and every entry the
    /// range touches are rewritten as one merged chunk file; on overlap the
    /// new bytes win.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if chunk files cannot be read or written.
    pub async fn put(
        &self,
        pak: &PakId,
        range: ChunkRange,
        bytes: Bytes,
    ) -> Result<PutOutcome, CacheError> {
        debug_assert_eq!(bytes.len() as u64, range.len());
        if range.is_empty() {
            return Ok(PutOutcome {
                merged_range: range,
                merged_entries: 0,
            });
        }

        let put_lock = self.put_lock(pak);
        let _put_guard = put_lock.lock().await;

        loop {
            // Plan under the index lock: either the range is covered, or we
            // know exactly which entries the merged span absorbs.
            let plan = {
                let mut chunks = self.paks.entry(pak.clone()).or_default();
                if let Some(covering) = chunks.covering_entry(&range) {
                    let tick = self.clock.fetch_add(1, Ordering::Relaxed);
                    if let Some(entry) = chunks.entries.get_mut(&covering.start) {
                        entry.last_access = tick;
                    }
                    Some(covering)
                } else {
                    None
                }
            };
            if let Some(covering) = plan {
                trace!(pak = %pak, range = %range, covering = %covering, "Range already resident");
                return Ok(PutOutcome {
                    merged_range: covering,
                    merged_entries: 0,
                });
            }

            let absorbed = {
                let chunks = self.paks.entry(pak.clone()).or_default();
                chunks.mergeable_with(&range)
            };
            let merged = absorbed.iter().fold(range, |acc, span| acc.merge(span));

            // Assemble the merged buffer outside the lock.
            let mut replan = false;
            let mut buf = vec![0u8; merged.len() as usize];
            for span in &absorbed {
                let path = chunk_file_path(&self.dir, pak, span);
                match tokio::fs::read(&path).await {
                    Ok(data) if data.len() as u64 == span.len() => {
                        let offset = (span.start - merged.start) as usize;
                        buf[offset..offset + data.len()].copy_from_slice(&data);
                    }
                    Ok(data) => {
                        warn!(
                            pak = %pak,
                            entry = %span,
                            expected_bytes = span.len(),
                            actual_bytes = data.len(),
                            "Chunk file length mismatch, dropping index entry"
                        );
                        self.remove_entry_if_current(pak, span);
                        let _ = tokio::fs::remove_file(&path).await;
                        replan = true;
                        break;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        self.remove_entry_if_current(pak, span);
                        replan = true;
                        break;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if replan {
                continue;
            }

            let offset = (range.start - merged.start) as usize;
            buf[offset..offset + bytes.len()].copy_from_slice(&bytes);

            // Write the merged chunk and move it into place atomically.
            let final_path = chunk_file_path(&self.dir, pak, &merged);
            let temp_id = self.temp_ids.fetch_add(1, Ordering::Relaxed);
            let temp_path = self.dir.join(format!(".put-{temp_id}.tmp"));
            tokio::fs::write(&temp_path, &buf).await?;
            tokio::fs::rename(&temp_path, &final_path).await?;

            // Revalidate and commit. Eviction, index repair, or invalidation
            // may have changed the pak's entries while we did I/O; commit
            // only if the merged span still absorbs exactly the planned set.
            let committed = {
                let mut chunks = self.paks.entry(pak.clone()).or_default();
                let current = chunks.mergeable_with(&merged);
                let plan_holds = current.len() == absorbed.len()
                    && current.iter().all(|span| absorbed.contains(span));
                if plan_holds {
                    for span in &absorbed {
                        chunks.entries.remove(&span.start);
                    }
                    let tick = self.clock.fetch_add(1, Ordering::Relaxed);
                    chunks.entries.insert(
                        merged.start,
                        ChunkEntry {
                            len: merged.len(),
                            last_access: tick,
                        },
                    );
                    true
                } else {
                    false
                }
            };

            if !committed {
                // Writers are serialized per pak, so this file is ours alone
                // and safe to discard before replanning.
                debug!(pak = %pak, range = %range, "Cache index changed during put, replanning");
                let _ = tokio::fs::remove_file(&final_path).await;
                continue;
            }

            let absorbed_bytes: u64 = absorbed.iter().map(|span| span.len()).sum();
            self.total_bytes
                .fetch_add(merged.len() - absorbed_bytes, Ordering::Relaxed);

            for span in &absorbed {
                let path = chunk_file_path(&self.dir, pak, span);
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        debug!(
                            path = %path.display(),
                            error = %err,
                            "Failed to delete absorbed chunk file"
                        );
                    }
                }
            }

            debug!(
                pak = %pak,
                range = %range,
                merged = %merged,
                absorbed = absorbed.len(),
                "Stored chunk"
            );

            self.evict_if_over_capacity().await?;

            return Ok(PutOutcome {
                merged_range: merged,
                merged_entries: absorbed.len(),
            });
        }
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Evict least-recently-used spans until resident bytes fit the budget.
    ///
    /// Spans intersecting an active [`ReadPin`] are skipped. If pins hold
    /// everything, the store is allowed to stay over budget and a warning
    /// is logged; the next eviction pass will retry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] only for unexpected I/O failures; missing
    /// files during deletion are ignored.
    pub async fn evict_if_over_capacity(&self) -> Result<EvictionReport, CacheError> {
        let mut report = EvictionReport::default();

        loop {
            let capacity = self.capacity.load(Ordering::Relaxed);
            let total = self.total_bytes.load(Ordering::Relaxed);
            if total <= capacity {
                break;
            }
            let need = total - capacity;

            let pinned: Vec<(PakId, ChunkRange)> = {
                let pins = self.pins.lock();
                pins.iter().map(|pin| (pin.pak.clone(), pin.range)).collect()
            };

            let mut candidates: Vec<(PakId, ChunkRange, u64)> = Vec::new();
            for item in self.paks.iter() {
                let pak = item.key();
                for (&start, entry) in &item.value().entries {
                    let span = ChunkRange::new(start, start + entry.len);
                    let is_pinned = pinned
                        .iter()
                        .any(|(pinned_pak, pinned_range)| {
                            pinned_pak == pak && pinned_range.intersects(&span)
                        });
                    if !is_pinned {
                        candidates.push((pak.clone(), span, entry.last_access));
                    }
                }
            }

            if candidates.is_empty() {
                warn!(
                    over_bytes = need,
                    "Cache over capacity but every resident span is pinned"
                );
                break;
            }

            // Oldest first.
            candidates.sort_by_key(|candidate| candidate.2);

            let mut victims: Vec<(PakId, ChunkRange)> = Vec::new();
            let mut planned = 0u64;
            for (pak, span, _) in candidates {
                if planned >= need {
                    break;
                }
                planned += span.len();
                victims.push((pak, span));
            }

            for (pak, span) in victims {
                if !self.remove_entry_if_current(&pak, &span) {
                    continue;
                }
                report.entries_removed += 1;
                report.bytes_freed += span.len();

                let path = chunk_file_path(&self.dir, &pak, &span);
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        debug!(
                            path = %path.display(),
                            error = %err,
                            "Failed to delete chunk file during eviction"
                        );
                    }
                }
                debug!(pak = %pak, range = %span, "Evicted chunk");
            }
        }

        if report.entries_removed > 0 {
            info!(
                %report,
                resident_bytes = self.total_bytes.load(Ordering::Relaxed),
                capacity_bytes = self.capacity.load(Ordering::Relaxed),
                "Cache eviction complete"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Drop every resident span of a package and delete its chunk files.
    ///
    /// Used when a package fails digest verification or is unregistered.
    /// Waits for any in-flight write to the same package to settle first.
    ///
    /// # Returns
    ///
    /// Bytes freed.
    pub async fn invalidate_pak(&self, pak: &PakId) -> Result<u64, CacheError> {
        let put_lock = self.put_lock(pak);
        let _put_guard = put_lock.lock().await;

        let spans: Vec<ChunkRange> = match self.paks.remove(pak) {
            Some((_, chunks)) => chunks.spans(),
            None => Vec::new(),
        };
        self.verified.remove(pak);

        let mut freed = 0u64;
        for span in &spans {
            freed += span.len();
            let path = chunk_file_path(&self.dir, pak, span);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(
                        path = %path.display(),
                        error = %err,
                        "Failed to delete chunk file during invalidation"
                    );
                }
            }
        }

        if freed > 0 {
            self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
            info!(pak = %pak, bytes_freed = freed, "Invalidated cached package");
        }
        Ok(freed)
    }

    /// Remove everything, including the residency snapshot.
    ///
    /// # Returns
    ///
    /// Bytes freed.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        let pak_ids: Vec<PakId> = self.paks.iter().map(|item| item.key().clone()).collect();
        let mut freed = 0u64;
        for pak in pak_ids {
            freed += self.invalidate_pak(&pak).await?;
        }

        if let Err(err) = tokio::fs::remove_file(snapshot_path(&self.dir)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        info!(bytes_freed = freed, "Cleared chunk cache");
        Ok(freed)
    }

    // ========================================================================
    // Verification state
    // ========================================================================

    /// Record that the package body verified against `digest`.
    pub fn mark_verified(&self, pak: &PakId, digest: impl Into<String>) {
        self.verified.insert(pak.clone(), digest.into());
    }

    /// Digest the package last verified against, if still fully intact.
    pub fn verified_digest(&self, pak: &PakId) -> Option<String> {
        self.verified.get(pak).map(|digest| digest.value().clone())
    }

    /// Whether the package has passed verification since its residency last
    /// changed.
    pub fn is_verified(&self, pak: &PakId) -> bool {
        self.verified.contains_key(pak)
    }

    /// Forget the verification result for a package.
    pub fn clear_verified(&self, pak: &PakId) {
        self.verified.remove(pak);
    }

    // ========================================================================
    // Snapshot and stats
    // ========================================================================

    /// Write the residency snapshot for warm restarts.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] or [`CacheError::Snapshot`] if the file
    /// cannot be written or encoded.
    pub async fn save_snapshot(&self) -> Result<(), CacheError> {
        let mut packages: Vec<PakSnapshot> = Vec::new();
        for item in self.paks.iter() {
            if item.value().entries.is_empty() {
                continue;
            }
            packages.push(PakSnapshot {
                name: item.key().clone(),
                ranges: item.value().spans(),
                verified_digest: self.verified_digest(item.key()),
            });
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        SnapshotFile::new(packages).save(&self.dir).await
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> CacheStats {
        let mut package_count = 0usize;
        let mut entry_count = 0usize;
        for item in self.paks.iter() {
            if !item.value().entries.is_empty() {
                package_count += 1;
                entry_count += item.value().entries.len();
            }
        }
        CacheStats {
            resident_bytes: self.total_bytes.load(Ordering::Relaxed),
            capacity_bytes: self.capacity.load(Ordering::Relaxed),
            package_count,
            entry_count,
            active_pins: self.pins.lock().len(),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn put_lock(&self, pak: &PakId) -> Arc<tokio::sync::Mutex<()>> {
        self.put_locks.entry(pak.clone()).or_default().clone()
    }

    /// Remove an index entry if it still matches `(start, len)` exactly.
    ///
    /// Revalidation makes this safe to call from stale plans: if the entry
    /// was merged away or already removed, this is a no-op.
    fn remove_entry_if_current(&self, pak: &PakId, span: &ChunkRange) -> bool {
        let removed = match self.paks.get_mut(pak) {
            Some(mut chunks) => {
                let current = chunks
                    .entries
                    .get(&span.start)
                    .is_some_and(|entry| entry.len == span.len());
                if current {
                    chunks.entries.remove(&span.start);
                }
                current
            }
            None => false,
        };

        if removed {
            self.total_bytes.fetch_sub(span.len(), Ordering::Relaxed);
            self.verified.remove(pak);
            self.paks.remove_if(pak, |_, chunks| chunks.entries.is_empty());
        }
        removed
    }
}

// ============================================================================
// Tests
// ============================================================================
