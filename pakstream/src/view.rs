//! The virtual package view: random-access reads over partially-resident paks.
//!
//! [`PakView`] presents every registered package as if it were a fully local
//! file. A read over resident bytes is served straight from the cache; a read
//! over missing bytes submits fetches for exactly the uncovered sub-ranges and
//! suspends until they land or the first one fails. Reads carry a deadline:
//! on expiry the caller gets [`ReadError::Timeout`] while the underlying
//! fetches keep running and warm the cache for the retry.
//!
//! # Design Principles
//!
//! - **Range-scoped failure**: a failed read never poisons neighbouring
//!   bytes; whatever sub-ranges did arrive stay cached.
//! - **Reads pin their range**: eviction cannot remove bytes out from under
//!   an in-progress read.
//! - **Cancellation is cheap**: dropping a pending read detaches its waiters
//!   without cancelling the fetches.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{ChunkStore, ReadPin};
use crate::manifest::PakId;
use crate::range::ChunkRange;
use crate::registry::PakRegistry;
use crate::scheduler::{FetchCommand, FetchFailure, FetchOutcome, Priority, SubmitResult};

/// Upper bound on submit rounds within one read. Round one fetches, round two
/// covers the single repeat a digest mismatch is allowed, and the registry
/// refuses further fetches once a package is marked failed.
const MAX_READ_ATTEMPTS: usize = 3;

// ============================================================================
// Errors
// ============================================================================

/// Why a read could not be satisfied.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The requested range extends past the end of the package.
    #[error("read {requested} exceeds package length {total}")]
    OutOfRange { requested: ChunkRange, total: u64 },

    /// A required fetch failed after exhausting its retries.
    #[error("transport failure after {attempts} attempts: {detail}")]
    Transport { attempts: u32, detail: String },

    /// The local cache could not store or serve the bytes.
    #[error("cache failure: {detail}")]
    Cache { detail: String },

    /// The package failed digest verification twice and is unusable.
    #[error("package {pak} failed digest verification")]
    Integrity { pak: PakId },

    /// The read deadline expired; fetches continue in the background.
    #[error("read timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The package is not registered (or was unregistered mid-read).
    #[error("package {pak} is not registered")]
    Unregistered { pak: PakId },

    /// The manifest lists no asset under this path.
    #[error("asset {path} not present in package {pak}")]
    UnknownAsset { pak: PakId, path: String },

    /// The streaming engine is shutting down.
    #[error("streaming engine is shutting down")]
    ShuttingDown,
}

impl ReadError {
    fn from_failure(pak: &PakId, failure: FetchFailure) -> Self {
        match failure {
            FetchFailure::Transport { attempts, detail } => Self::Transport { attempts, detail },
            FetchFailure::Cache { detail } => Self::Cache { detail },
            FetchFailure::Integrity => Self::Integrity { pak: pak.clone() },
            FetchFailure::Unregistered => Self::Unregistered { pak: pak.clone() },
            FetchFailure::ShuttingDown => Self::ShuttingDown,
        }
    }

    fn cache(err: crate::cache::CacheError) -> Self {
        Self::Cache {
            detail: err.to_string(),
        }
    }
}

// ============================================================================
// Read Status
// ============================================================================

/// Result of a non-blocking read attempt.
#[derive(Debug)]
pub enum ReadStatus {
    /// Every requested byte was resident.
    Ready(Bytes),

    /// Fetches were submitted; the handle resolves when they settle.
    Pending(ReadHandle),
}

/// A pending read that can be polled or awaited.
///
/// Holds the read's cache pin, so the range cannot be evicted while the
/// handle is alive. Dropping the handle abandons the read; the fetches it
/// attached to continue and populate the cache.
#[derive(Debug)]
pub struct ReadHandle {
    view: PakView,
    pak: PakId,
    range: ChunkRange,
    receivers: Vec<broadcast::Receiver<FetchOutcome>>,
    _pin: ReadPin,
    started: Instant,
}

impl ReadHandle {
    /// Whether every requested byte is resident right now.
    pub fn is_ready(&self) -> bool {
        self.view.store.contains(&self.pak, &self.range)
    }

    /// The range this handle is waiting on.
    pub fn range(&self) -> ChunkRange {
        self.range
    }

    /// Suspends until the read settles, honoring the remainder of the
    /// deadline that started when the read was first attempted.
    pub async fn wait(self) -> Result<Bytes, ReadError> {
        let Self {
            view,
            pak,
            range,
            receivers,
            _pin,
            started,
        } = self;

        let remaining = view.read_timeout.saturating_sub(started.elapsed());
        let settled = async {
            view.settle(&pak, receivers).await?;
            view.resident_read(&pak, range, Priority::BLOCKING).await
        };
        match tokio::time::timeout(remaining, settled).await {
            Ok(result) => result,
            Err(_) => {
                debug!(pak = %pak, range = %range, "Pending read timed out");
                Err(ReadError::Timeout {
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

// ============================================================================
// Pak View
// ============================================================================

/// Random-access read facade over the cache, registry, and fetch daemon.
///
/// Cheap to clone; every clone talks to the same engine.
#[derive(Debug, Clone)]
pub struct PakView {
    store: Arc<ChunkStore>,
    registry: Arc<PakRegistry>,
    command_tx: mpsc::Sender<FetchCommand>,
    read_timeout: Duration,
}

impl PakView {
    pub fn new(
        store: Arc<ChunkStore>,
        registry: Arc<PakRegistry>,
        command_tx: mpsc::Sender<FetchCommand>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            command_tx,
            read_timeout,
        }
    }

    /// Deadline applied to each blocking read.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Reads `length` bytes at `offset`, fetching whatever is missing.
    ///
    /// # Errors
    ///
    /// [`ReadError::OutOfRange`] when the range exceeds the package length,
    /// [`ReadError::Timeout`] when the deadline expires first, and the
    /// terminal failure of the first fetch that failed otherwise.
    pub async fn read(&self, pak: &PakId, offset: u64, length: u64) -> Result<Bytes, ReadError> {
        let range = self.bounded_range(pak, offset, length)?;
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let started = Instant::now();
        // Pin first: bytes that land while we wait must survive until served.
        let _pin = self.store.pin(pak, range);

        match tokio::time::timeout(
            self.read_timeout,
            self.resident_read(pak, range, Priority::BLOCKING),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                debug!(pak = %pak, range = %range, "Read timed out; fetches continue in background");
                Err(ReadError::Timeout {
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Non-blocking read: resident bytes come back immediately, otherwise
    /// fetches are submitted and a [`ReadHandle`] tracks them.
    pub async fn try_read(
        &self,
        pak: &PakId,
        offset: u64,
        length: u64,
    ) -> Result<ReadStatus, ReadError> {
        let range = self.bounded_range(pak, offset, length)?;
        if range.is_empty() {
            return Ok(ReadStatus::Ready(Bytes::new()));
        }

        let started = Instant::now();
        let pin = self.store.pin(pak, range);
        if let Some(bytes) = self.store.get(pak, range).await.map_err(ReadError::cache)? {
            return Ok(ReadStatus::Ready(bytes));
        }

        let submitted = self.submit(pak, range, Priority::BLOCKING).await?;
        if let Some(failure) = submitted.rejected {
            return Err(ReadError::from_failure(pak, failure));
        }
        if submitted.is_resident() {
            // A fetch completed between our miss and the submission.
            if let Some(bytes) = self.store.get(pak, range).await.map_err(ReadError::cache)? {
                return Ok(ReadStatus::Ready(bytes));
            }
        }

        Ok(ReadStatus::Pending(ReadHandle {
            view: self.clone(),
            pak: pak.clone(),
            range,
            receivers: submitted.receivers,
            _pin: pin,
            started,
        }))
    }

    /// Requests a range speculatively, with nobody waiting on it.
    pub async fn prefetch(&self, pak: &PakId, offset: u64, length: u64) -> Result<(), ReadError> {
        let range = self.bounded_range(pak, offset, length)?;
        if range.is_empty() {
            return Ok(());
        }
        self.command_tx
            .send(FetchCommand::Prefetch {
                pak: pak.clone(),
                range,
            })
            .await
            .map_err(|_| ReadError::ShuttingDown)
    }

    /// Reads a named asset through the package's manifest.
    pub async fn read_asset(&self, pak: &PakId, path: &str) -> Result<Bytes, ReadError> {
        let manifest = self
            .registry
            .manifest(pak)
            .ok_or_else(|| ReadError::Unregistered { pak: pak.clone() })?;
        let range = manifest
            .asset_range(path)
            .ok_or_else(|| ReadError::UnknownAsset {
                pak: pak.clone(),
                path: path.to_string(),
            })?;
        self.read(pak, range.start, range.len()).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Validates a read against the registered package length.
    fn bounded_range(&self, pak: &PakId, offset: u64, length: u64) -> Result<ChunkRange, ReadError> {
        let total = self
            .registry
            .manifest(pak)
            .map(|manifest| manifest.total_length)
            .ok_or_else(|| ReadError::Unregistered { pak: pak.clone() })?;

        let end = offset.checked_add(length).filter(|end| *end <= total);
        match end {
            Some(end) => Ok(ChunkRange::new(offset, end)),
            None => Err(ReadError::OutOfRange {
                requested: ChunkRange {
                    start: offset,
                    end: offset.saturating_add(length),
                },
                total,
            }),
        }
    }

    /// Serves `range` from the cache, submitting fetches until it is
    /// resident or a fetch fails. The caller holds the pin.
    async fn resident_read(
        &self,
        pak: &PakId,
        range: ChunkRange,
        priority: Priority,
    ) -> Result<Bytes, ReadError> {
        for _ in 0..MAX_READ_ATTEMPTS {
            if let Some(bytes) = self.store.get(pak, range).await.map_err(ReadError::cache)? {
                return Ok(bytes);
            }

            let submitted = self.submit(pak, range, priority).await?;
            if let Some(failure) = submitted.rejected {
                return Err(ReadError::from_failure(pak, failure));
            }
            // Ok covers both "all stored" and "refetch underway after a
            // digest mismatch"; the next pass re-checks the cache either way.
            self.settle(pak, submitted.receivers).await?;
        }
        Err(ReadError::Integrity { pak: pak.clone() })
    }

    /// Sends a submit command and waits for the daemon's reply.
    async fn submit(
        &self,
        pak: &PakId,
        range: ChunkRange,
        priority: Priority,
    ) -> Result<SubmitResult, ReadError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(FetchCommand::Submit {
                pak: pak.clone(),
                range,
                priority,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ReadError::ShuttingDown)?;
        reply_rx.await.map_err(|_| ReadError::ShuttingDown)
    }

    /// Awaits every fetch outcome, failing with the first error to arrive.
    async fn settle(
        &self,
        pak: &PakId,
        receivers: Vec<broadcast::Receiver<FetchOutcome>>,
    ) -> Result<(), ReadError> {
        let mut pending: FuturesUnordered<_> = receivers
            .into_iter()
            .map(|mut receiver| async move { receiver.recv().await })
            .collect();

        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(FetchOutcome::Stored) | Ok(FetchOutcome::IntegrityRetry) => {}
                Ok(FetchOutcome::Failed(failure)) => {
                    return Err(ReadError::from_failure(pak, failure));
                }
                // A fetch entry dropped without broadcasting means the daemon
                // is gone.
                Err(_) => return Err(ReadError::ShuttingDown),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ChunkFetcher, RetryPolicy};
    use crate::scheduler::{FetchDaemon, FetchDaemonConfig, InFlightTable};
    use crate::source::tests::MockPakSource;
    use crate::source::PakSource;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _temp: TempDir,
        source: Arc<MockPakSource>,
        store: Arc<ChunkStore>,
        registry: Arc<PakRegistry>,
        view: PakView,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    }

    async fn start_view(source: MockPakSource) -> Harness {
        start_view_with_timeout(source, Duration::from_secs(2)).await
    }

    async fn start_view_with_timeout(source: MockPakSource, read_timeout: Duration) -> Harness {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(source);
        let store = Arc::new(ChunkStore::open(temp.path(), 1 << 30).await.unwrap());
        let registry = Arc::new(PakRegistry::new(Arc::clone(&store)));
        let inflight = Arc::new(InFlightTable::new());
        let (events, _) = broadcast::channel(64);
        let fetcher = Arc::new(ChunkFetcher::new(
            Arc::clone(&source) as Arc<dyn PakSource>,
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        ));

        let (daemon, command_tx) = FetchDaemon::new(
            FetchDaemonConfig::default(),
            fetcher,
            Arc::clone(&store),
            Arc::clone(&registry),
            inflight,
            events,
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        let view = PakView::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            command_tx,
            read_timeout,
        );

        Harness {
            _temp: temp,
            source,
            store,
            registry,
            view,
            shutdown,
            handle,
        }
    }

    impl Harness {
        async fn register(&self, name: &str) -> PakId {
            let pak = PakId::new(name).unwrap();
            let manifest = self.source.manifest_for(&pak).await.unwrap();
            self.registry.register(manifest).unwrap();
            pak
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.handle.await.unwrap();
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_fetches_missing_bytes_and_serves_them() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let bytes = harness.view.read(&pak, 100, 300).await.unwrap();
        assert_eq!(&bytes[..], &content[100..400]);
        assert_eq!(harness.source.read_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_read_of_resident_bytes_touches_no_network() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        harness.view.read(&pak, 0, 500).await.unwrap();
        assert_eq!(harness.source.read_count(), 1);

        // Contained in what the first read cached.
        let bytes = harness.view.read(&pak, 200, 100).await.unwrap();
        assert_eq!(&bytes[..], &content[200..300]);
        assert_eq!(harness.source.read_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_read_fetches_only_uncovered_remainder() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        harness.view.read(&pak, 0, 500).await.unwrap();
        let bytes = harness.view.read(&pak, 400, 300).await.unwrap();
        assert_eq!(&bytes[..], &content[400..700]);

        assert_eq!(
            harness.source.read_log(),
            vec![
                (pak.clone(), ChunkRange::new(0, 500)),
                (pak.clone(), ChunkRange::new(500, 700)),
            ]
        );

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_out_of_range_read_rejected_without_fetch() {
        let source = MockPakSource::new().with_package("island", body(100));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let result = harness.view.read(&pak, 50, 100).await;
        assert!(matches!(
            result,
            Err(ReadError::OutOfRange { total: 100, .. })
        ));
        assert_eq!(harness.source.read_count(), 0);

        // Offset + length overflowing u64 is out of range, not a panic.
        let result = harness.view.read(&pak, u64::MAX, 2).await;
        assert!(matches!(result, Err(ReadError::OutOfRange { .. })));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_zero_length_read_is_empty_and_free() {
        let source = MockPakSource::new().with_package("island", body(100));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let bytes = harness.view.read(&pak, 40, 0).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(harness.source.read_count(), 0);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_read_unregistered_package() {
        let source = MockPakSource::new();
        let harness = start_view(source).await;
        let pak = PakId::new("ghost").unwrap();

        let result = harness.view.read(&pak, 0, 10).await;
        assert!(matches!(result, Err(ReadError::Unregistered { .. })));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        source.set_read_delay(Duration::from_millis(50));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let first = {
            let view = harness.view.clone();
            let pak = pak.clone();
            tokio::spawn(async move { view.read(&pak, 0, 500).await })
        };
        // Let the covering fetch get submitted before the contained read.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let view = harness.view.clone();
            let pak = pak.clone();
            tokio::spawn(async move { view.read(&pak, 200, 100).await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(&first[..], &content[0..500]);
        assert_eq!(&second[..], &content[200..300]);
        assert_eq!(harness.source.read_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_transport_failure_propagates_to_reader() {
        let source = MockPakSource::new().with_package("island", body(1000));
        source.fail_reads(10);
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let result = harness.view.read(&pak, 0, 100).await;
        match result {
            Err(ReadError::Transport { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected transport error, got {other:?}"),
        }

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_read_timeout_leaves_fetch_running() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        source.set_read_delay(Duration::from_millis(150));
        let harness = start_view_with_timeout(source, Duration::from_millis(40)).await;
        let pak = harness.register("island").await;

        let result = harness.view.read(&pak, 0, 500).await;
        assert!(matches!(result, Err(ReadError::Timeout { .. })));

        // The fetch finishes anyway and warms the cache for the retry.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.store.contains(&pak, &ChunkRange::new(0, 500)));
        let bytes = harness.view.read(&pak, 0, 500).await.unwrap();
        assert_eq!(&bytes[..], &content[0..500]);
        assert_eq!(harness.source.read_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_try_read_resident_and_pending() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        source.set_read_delay(Duration::from_millis(50));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        // Nothing resident yet: pending, then resolvable.
        let status = harness.view.try_read(&pak, 0, 200).await.unwrap();
        let handle = match status {
            ReadStatus::Pending(handle) => handle,
            ReadStatus::Ready(_) => panic!("nothing should be resident yet"),
        };
        assert!(!handle.is_ready());
        let bytes = handle.wait().await.unwrap();
        assert_eq!(&bytes[..], &content[0..200]);

        // Now resident: immediate.
        match harness.view.try_read(&pak, 50, 100).await.unwrap() {
            ReadStatus::Ready(bytes) => assert_eq!(&bytes[..], &content[50..150]),
            ReadStatus::Pending(_) => panic!("bytes are resident"),
        }
        assert_eq!(harness.source.read_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_pending_read_leaves_fetch_to_finish() {
        let source = MockPakSource::new().with_package("island", body(1000));
        source.set_read_delay(Duration::from_millis(50));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let status = harness.view.try_read(&pak, 0, 300).await.unwrap();
        assert!(matches!(status, ReadStatus::Pending(_)));
        drop(status);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(harness.store.contains(&pak, &ChunkRange::new(0, 300)));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_prefetch_populates_cache_without_waiting() {
        let source = MockPakSource::new().with_package("island", body(1000));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        harness.view.prefetch(&pak, 0, 600).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(harness.store.contains(&pak, &ChunkRange::new(0, 600)));
        assert_eq!(harness.source.read_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_read_asset_resolves_manifest_range() {
        let content = body(1000);
        let source = MockPakSource::new()
            .with_package("island", content.clone())
            .with_assets(
                "island",
                vec![crate::manifest::AssetEntry {
                    path: "maps/overworld.umap".to_string(),
                    offset: 128,
                    length: 256,
                }],
            );
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        let bytes = harness
            .view
            .read_asset(&pak, "maps/overworld.umap")
            .await
            .unwrap();
        assert_eq!(&bytes[..], &content[128..384]);

        let missing = harness.view.read_asset(&pak, "maps/underworld.umap").await;
        assert!(matches!(missing, Err(ReadError::UnknownAsset { .. })));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_integrity_mismatch_retries_once_then_fails() {
        let source = MockPakSource::new().with_corrupt_package("island", body(300));
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        // One read spanning the whole body drives fetch -> verify -> mismatch
        // -> invalidate -> refetch -> second mismatch -> terminal failure.
        let result = harness.view.read(&pak, 0, 300).await;
        assert!(matches!(result, Err(ReadError::Integrity { .. })));
        assert_eq!(harness.source.read_count(), 2);
        assert!(harness.store.residency(&pak).is_empty());

        // Terminal state short-circuits without touching the source.
        let result = harness.view.read(&pak, 0, 100).await;
        assert!(matches!(result, Err(ReadError::Integrity { .. })));
        assert_eq!(harness.source.read_count(), 2);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_landed_subranges() {
        let content = body(1000);
        let source = MockPakSource::new().with_package("island", content.clone());
        let harness = start_view(source).await;
        let pak = harness.register("island").await;

        // Seed [0, 200), then fail the next fetch (both retry attempts): a
        // spanning read needs [200, 600); the failure is range-scoped.
        harness.view.read(&pak, 0, 200).await.unwrap();
        harness.source.fail_reads(2);

        let result = harness.view.read(&pak, 0, 600).await;
        assert!(matches!(result, Err(ReadError::Transport { .. })));
        assert!(harness.store.contains(&pak, &ChunkRange::new(0, 200)));

        // Source recovers; the retry only needs the remainder.
        let bytes = harness.view.read(&pak, 0, 600).await.unwrap();
        assert_eq!(&bytes[..], &content[0..600]);

        harness.stop().await;
    }
}
