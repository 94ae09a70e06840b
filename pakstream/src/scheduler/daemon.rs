//! The fetch daemon: single owner of the fetch queue and in-flight table.
//!
//! All fetch scheduling flows through one task. Callers send
//! [`FetchCommand`]s over a channel; the daemon deduplicates each request
//! against the cache and the in-flight table, enqueues whatever remains, and
//! dispatches queued fetches into spawned worker tasks, at most
//! `max_concurrent_fetches` at a time.
//!
//! # Design Principles
//!
//! - **Single writer**: only the daemon queries and mutates the queue and the
//!   in-flight table, so check-then-insert is atomic without extra locking.
//! - **No preemption**: a dispatched fetch always runs to completion. Priority
//!   is decided at dispatch time only.
//! - **Demotion over cancellation**: a queued blocking fetch whose waiters
//!   have all gone away is re-queued at prefetch priority rather than
//!   dropped; the bytes still warm the cache.
//! - **Completion before broadcast**: a worker removes its in-flight entry
//!   before broadcasting the outcome, so a request that arrives after the
//!   broadcast finds the cache populated instead of a settled fetch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{bytes_digest, file_digest, ChunkStore};
use crate::fetch::ChunkFetcher;
use crate::manifest::PakId;
use crate::range::ChunkRange;
use crate::registry::{IntegrityState, PakRegistry};
use crate::scheduler::inflight::{FetchEntry, FetchFailure, FetchOutcome, InFlightTable};
use crate::scheduler::policy::Priority;
use crate::scheduler::queue::FetchQueue;
use crate::service::StreamEvent;

/// Default number of fetches allowed to run concurrently.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// Default capacity of the command channel.
pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long shutdown waits for dispatched fetch tasks to wind down.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Configuration
// ============================================================================

/// Fetch daemon tuning knobs.
#[derive(Debug, Clone)]
pub struct FetchDaemonConfig {
    /// Maximum number of fetches in flight at once.
    pub max_concurrent_fetches: usize,

    /// Capacity of the command channel.
    pub command_channel_capacity: usize,

    /// Whether completed packages are checked against their manifest digest.
    ///
    /// When disabled (unsigned mode) a package is marked verified as soon as
    /// every byte is resident, without hashing.
    pub verify_digests: bool,
}

impl Default for FetchDaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            command_channel_capacity: DEFAULT_COMMAND_CHANNEL_CAPACITY,
            verify_digests: true,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Commands accepted by the fetch daemon.
#[derive(Debug)]
pub enum FetchCommand {
    /// Request a byte range on behalf of a waiting reader.
    ///
    /// The reply carries one outcome receiver per fetch the request depends
    /// on; an empty reply means every requested byte is already resident.
    Submit {
        pak: PakId,
        range: ChunkRange,
        priority: Priority,
        reply: oneshot::Sender<SubmitResult>,
    },

    /// Request a byte range with nobody waiting on it.
    Prefetch { pak: PakId, range: ChunkRange },

    /// Cancel all queued and in-flight fetches for a package and drop its
    /// cached bytes. Waiters are failed with
    /// [`FetchFailure::Unregistered`].
    Unregister {
        pak: PakId,
        reply: oneshot::Sender<()>,
    },
}

/// Reply to a [`FetchCommand::Submit`].
#[derive(Debug)]
pub struct SubmitResult {
    /// One receiver per fetch (existing or newly enqueued) the request
    /// overlaps. The caller awaits all of them, then reads from the cache.
    pub receivers: Vec<broadcast::Receiver<FetchOutcome>>,

    /// Set when the daemon refused the request outright.
    pub rejected: Option<FetchFailure>,
}

impl SubmitResult {
    fn attached(receivers: Vec<broadcast::Receiver<FetchOutcome>>) -> Self {
        Self {
            receivers,
            rejected: None,
        }
    }

    fn rejected(failure: FetchFailure) -> Self {
        Self {
            receivers: Vec::new(),
            rejected: Some(failure),
        }
    }

    /// Whether the requested bytes were already resident, with no fetch to
    /// wait for.
    pub fn is_resident(&self) -> bool {
        self.receivers.is_empty() && self.rejected.is_none()
    }
}

// ============================================================================
// Daemon
// ============================================================================

/// Long-running task that schedules all chunk fetches.
///
/// Created with [`FetchDaemon::new`], which also returns the command sender,
/// then driven by [`FetchDaemon::run`] until its cancellation token fires.
pub struct FetchDaemon {
    config: FetchDaemonConfig,
    command_rx: mpsc::Receiver<FetchCommand>,
    completion_tx: mpsc::Sender<()>,
    completion_rx: mpsc::Receiver<()>,
    queue: FetchQueue,
    /// Fetch tasks currently dispatched.
    active: usize,
    worker: FetchWorker,
}

impl FetchDaemon {
    /// Creates the daemon and its command channel.
    pub fn new(
        config: FetchDaemonConfig,
        fetcher: Arc<ChunkFetcher>,
        store: Arc<ChunkStore>,
        registry: Arc<PakRegistry>,
        inflight: Arc<InFlightTable>,
        events: broadcast::Sender<StreamEvent>,
    ) -> (Self, mpsc::Sender<FetchCommand>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
        // Each fetch task sends exactly one completion, so a capacity equal
        // to the concurrency limit means sends never block.
        let (completion_tx, completion_rx) = mpsc::channel(config.max_concurrent_fetches.max(1));

        let verify_digests = config.verify_digests;
        let daemon = Self {
            config,
            command_rx,
            completion_tx,
            completion_rx,
            queue: FetchQueue::new(),
            active: 0,
            worker: FetchWorker {
                fetcher,
                store,
                registry,
                inflight,
                events,
                verify_digests,
            },
        };
        (daemon, command_tx)
    }

    /// Runs the daemon until `shutdown` is cancelled.
    ///
    /// On shutdown, queued and in-flight fetches are failed with
    /// [`FetchFailure::ShuttingDown`] and dispatched tasks are given a bounded
    /// window to wind down before the daemon returns.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            max_concurrent = self.config.max_concurrent_fetches,
            "Fetch daemon started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Fetch daemon received shutdown signal");
                    break;
                }

                Some(()) = self.completion_rx.recv() => {
                    self.active -= 1;
                    self.dispatch();
                }

                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                    self.dispatch();
                }
            }
        }

        self.drain().await;
        info!("Fetch daemon stopped");
    }

    async fn handle_command(&mut self, command: FetchCommand) {
        match command {
            FetchCommand::Submit {
                pak,
                range,
                priority,
                reply,
            } => {
                let result = self.submit(&pak, range, priority);
                if reply.send(result).is_err() {
                    debug!(pak = %pak, range = %range, "Submitter went away before receiving fetch handles");
                }
            }
            FetchCommand::Prefetch { pak, range } => {
                // Dropping the result detaches the receivers; prefetch has no
                // waiters by definition.
                let _ = self.submit(&pak, range, Priority::PREFETCH);
            }
            FetchCommand::Unregister { pak, reply } => {
                self.unregister(&pak).await;
                let _ = reply.send(());
            }
        }
    }

    /// Deduplicates a request and enqueues whatever nobody is fetching yet.
    fn submit(&mut self, pak: &PakId, range: ChunkRange, priority: Priority) -> SubmitResult {
        if !self.worker.registry.is_registered(pak) {
            debug!(pak = %pak, range = %range, "Rejecting fetch for unregistered package");
            return SubmitResult::rejected(FetchFailure::Unregistered);
        }
        if self.worker.registry.integrity(pak) == Some(IntegrityState::Failed) {
            debug!(pak = %pak, "Rejecting fetch for package that failed verification");
            return SubmitResult::rejected(FetchFailure::Integrity);
        }

        // Resident bytes need no fetch. Residency is checked here, on the
        // daemon task, so no fetch can complete between this check and the
        // in-flight registration below (workers advance residency strictly
        // before they retire their in-flight entry).
        let mut receivers = Vec::new();
        let mut new_ranges = Vec::new();
        for missing in self.worker.store.missing_within(pak, &range) {
            let registration = self.worker.inflight.register(pak, missing);
            receivers.extend(registration.receivers);
            new_ranges.extend(registration.new_ranges);
        }

        if !new_ranges.is_empty() {
            // One sequence per batch: the heap then orders a request's chunks
            // by ascending offset via the (pak, start) tiebreak.
            let sequence = self.queue.next_sequence();
            for new_range in new_ranges {
                let entry = self.worker.inflight.insert(pak, new_range);
                receivers.push(entry.subscribe());
                self.queue.push(pak.clone(), new_range, priority, sequence);
            }
        }

        debug!(
            pak = %pak,
            range = %range,
            priority = %priority,
            fetches = receivers.len(),
            "Fetch request registered"
        );
        SubmitResult::attached(receivers)
    }

    /// Cancels everything for a package and drops its cached bytes.
    async fn unregister(&mut self, pak: &PakId) {
        let dequeued = self.queue.remove_pak(pak);
        let entries = self.worker.inflight.drain_pak(pak);
        for entry in &entries {
            entry.mark_discard();
            entry.complete(FetchOutcome::Failed(FetchFailure::Unregistered));
        }

        match self.worker.store.invalidate_pak(pak).await {
            Ok(freed) => info!(
                pak = %pak,
                queued_cancelled = dequeued.len(),
                fetches_cancelled = entries.len(),
                bytes_freed = freed,
                "Package removed from streaming"
            ),
            Err(err) => warn!(
                pak = %pak,
                error = %err,
                "Failed to invalidate cache for unregistered package"
            ),
        }
    }

    /// Dispatches queued fetches into worker tasks while slots are free.
    fn dispatch(&mut self) {
        while self.active < self.config.max_concurrent_fetches {
            let Some(next) = self.queue.pop() else {
                break;
            };

            let Some(entry) = self.worker.inflight.entry(&next.pak, &next.range) else {
                // Unregistered while queued; nothing left to fetch.
                continue;
            };

            if next.priority.is_blocking() && entry.waiter_count() == 0 {
                // Every caller gave up before dispatch. The bytes are still
                // worth caching, but not ahead of live reads.
                debug!(pak = %next.pak, range = %next.range, "Demoting abandoned blocking fetch to prefetch");
                let sequence = self.queue.next_sequence();
                self.queue.push(next.pak, next.range, Priority::PREFETCH, sequence);
                continue;
            }

            debug!(
                pak = %next.pak,
                range = %next.range,
                priority = %next.priority,
                queued_ms = next.wait_time().as_millis() as u64,
                "Dispatching fetch"
            );
            self.active += 1;
            let worker = self.worker.clone();
            let completion_tx = self.completion_tx.clone();
            tokio::spawn(async move {
                worker.run(entry).await;
                // The daemon only drops its receiver after draining, so this
                // send can fail only once shutdown has given up on us.
                let _ = completion_tx.send(()).await;
            });
        }
    }

    /// Fails outstanding work and waits for dispatched tasks to finish.
    async fn drain(&mut self) {
        let queued = self.queue.len();
        self.queue.clear();
        let entries = self.worker.inflight.drain_all();
        for entry in &entries {
            entry.mark_discard();
            entry.complete(FetchOutcome::Failed(FetchFailure::ShuttingDown));
        }
        if queued > 0 || !entries.is_empty() {
            info!(
                queued,
                in_flight = entries.len(),
                "Cancelled outstanding fetches for shutdown"
            );
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.active > 0 {
            match tokio::time::timeout_at(deadline, self.completion_rx.recv()).await {
                Ok(Some(())) => self.active -= 1,
                Ok(None) => break,
                Err(_) => {
                    warn!(active = self.active, "Fetch tasks still running at shutdown deadline");
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Fetch Worker
// ============================================================================

/// Everything a spawned fetch task needs, cloned per dispatch.
#[derive(Clone)]
struct FetchWorker {
    fetcher: Arc<ChunkFetcher>,
    store: Arc<ChunkStore>,
    registry: Arc<PakRegistry>,
    inflight: Arc<InFlightTable>,
    events: broadcast::Sender<StreamEvent>,
    verify_digests: bool,
}

impl FetchWorker {
    /// Runs one fetch to completion: transfer, store, verify when due, then
    /// retire the in-flight entry and broadcast the outcome.
    async fn run(self, entry: Arc<FetchEntry>) {
        let pak = entry.pak.clone();
        let range = entry.range;

        let bytes = match self.fetcher.fetch(&pak, range).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inflight.remove(&pak, &range);
                if entry.should_discard() {
                    debug!(pak = %pak, range = %range, "Dropping failed fetch for unregistered package");
                    return;
                }
                warn!(pak = %pak, range = %range, attempts = err.attempts(), error = %err, "Fetch failed");
                entry.complete(FetchOutcome::Failed(FetchFailure::Transport {
                    attempts: err.attempts(),
                    detail: err.to_string(),
                }));
                return;
            }
        };

        if entry.should_discard() {
            debug!(pak = %pak, range = %range, "Dropping fetched bytes for unregistered package");
            self.inflight.remove(&pak, &range);
            return;
        }

        let outcome = match self.store.put(&pak, range, bytes).await {
            Ok(put) => {
                debug!(
                    pak = %pak,
                    range = %range,
                    merged = %put.merged_range,
                    absorbed = put.merged_entries,
                    "Chunk stored"
                );
                self.verify_if_complete(&pak).await
            }
            Err(err) => {
                error!(pak = %pak, range = %range, error = %err, "Failed to store fetched chunk");
                FetchOutcome::Failed(FetchFailure::Cache {
                    detail: err.to_string(),
                })
            }
        };

        if entry.should_discard() {
            // Unregistration raced the store write; its invalidation may have
            // run before our put landed, so invalidate again.
            let _ = self.store.invalidate_pak(&pak).await;
            self.inflight.remove(&pak, &range);
            return;
        }

        // Retire the entry before broadcasting, so a request arriving after
        // the outcome finds the cache rather than a settled fetch.
        self.inflight.remove(&pak, &range);
        entry.complete(outcome);
    }

    /// Runs the whole-package digest check if this fetch made the package
    /// fully resident.
    async fn verify_if_complete(&self, pak: &PakId) -> FetchOutcome {
        let Some(manifest) = self.registry.manifest(pak) else {
            return FetchOutcome::Stored;
        };
        if !self.store.is_fully_resident(pak, manifest.total_length) || self.store.is_verified(pak)
        {
            return FetchOutcome::Stored;
        }

        self.emit(StreamEvent::FullyResident { pak: pak.clone() });
        info!(pak = %pak, total_bytes = manifest.total_length, "Package fully resident");

        if !self.verify_digests {
            // Unsigned mode: full residency is all we ask of a package.
            self.store.mark_verified(pak, manifest.digest.clone());
            self.registry.mark_verified(pak);
            self.persist_snapshot().await;
            self.emit(StreamEvent::Verified { pak: pak.clone() });
            debug!(pak = %pak, "Digest verification disabled, marking package verified");
            return FetchOutcome::Stored;
        }

        let actual = if manifest.total_length == 0 {
            // No chunk file to hash; an empty body has a fixed digest.
            Ok(bytes_digest(&[]))
        } else {
            match self.store.single_entry_path(pak) {
                Some((_, path)) => file_digest(&path).await,
                None => {
                    // Residency changed under us; the next completed fetch
                    // re-runs the check.
                    return FetchOutcome::Stored;
                }
            }
        };

        let actual = match actual {
            Ok(digest) => digest,
            Err(err) => {
                error!(pak = %pak, error = %err, "Could not hash package for verification");
                return FetchOutcome::Failed(FetchFailure::Cache {
                    detail: err.to_string(),
                });
            }
        };

        if actual == manifest.digest {
            self.store.mark_verified(pak, manifest.digest.clone());
            self.registry.mark_verified(pak);
            self.persist_snapshot().await;
            self.emit(StreamEvent::Verified { pak: pak.clone() });
            info!(pak = %pak, digest = %manifest.digest, "Package verified");
            return FetchOutcome::Stored;
        }

        warn!(
            pak = %pak,
            expected = %manifest.digest,
            actual = %actual,
            "Package digest mismatch, invalidating cached bytes"
        );
        if let Err(err) = self.store.invalidate_pak(pak).await {
            warn!(pak = %pak, error = %err, "Failed to invalidate mismatched package");
        }

        match self.registry.record_verification_failure(pak) {
            Some(IntegrityState::Retrying) => {
                self.emit(StreamEvent::IntegrityRetry { pak: pak.clone() });
                FetchOutcome::IntegrityRetry
            }
            _ => {
                error!(pak = %pak, "Package failed verification twice, giving up");
                self.emit(StreamEvent::IntegrityFailed { pak: pak.clone() });
                FetchOutcome::Failed(FetchFailure::Integrity)
            }
        }
    }

    /// Persists the residency snapshot so a restart keeps the verified flag.
    ///
    /// Best effort: the startup scan rebuilds residency from chunk files
    /// without it, at the cost of re-hashing.
    async fn persist_snapshot(&self) {
        if let Err(err) = self.store.save_snapshot().await {
            warn!(error = %err, "Failed to persist residency snapshot");
        }
    }

    fn emit(&self, event: StreamEvent) {
        // Nobody listening is fine; events are best-effort.
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Tests
// ============================================================================
