//! Service facade wiring the streaming subsystems together.
//!
//! `StreamerService` owns the pak source, chunk store, registry, fetch daemon,
//! and view, and exposes the package-level operations consumers actually call:
//! register, stream, wait for completion, unregister, shut down. Everything
//! below it stays composable for tests; this type is the one piece that knows
//! the full startup and teardown order.
//!
//! # Startup Sequence
//!
//! 1. Build the pak source for the configured mode (HTTP or local directory)
//! 2. Open the chunk store and trim it to the configured capacity
//! 3. Create the registry, in-flight table, and fetcher
//! 4. Spawn the fetch daemon with a cancellation token
//! 5. Build the consumer-facing view
//!
//! Shutdown reverses this: cancel the daemon, wait for it to drain, then
//! persist the residency snapshot so a restart resumes warm.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{bytes_digest, CacheError, CacheStats, ChunkStore};
use crate::config::{ConfigFile, ConfigFileError, SourceMode};
use crate::fetch::ChunkFetcher;
use crate::manifest::{ManifestError, PakId, PakManifest};
use crate::registry::{IntegrityState, PakRegistry, RegistryError};
use crate::scheduler::{FetchCommand, FetchDaemon, InFlightTable};
use crate::service::events::{event_channel, StreamEvent};
use crate::source::{HttpPakSource, LocalPakSource, PakSource, SourceError};
use crate::view::{PakView, ReadError};

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the service facade.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration problem discovered at startup
    #[error(transparent)]
    Config(#[from] ConfigFileError),

    /// Invalid package name or manifest content
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The pak source failed while fetching a manifest
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Registry refused the operation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The cache store failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A streaming operation failed
    #[error(transparent)]
    Read(#[from] ReadError),
}

// ============================================================================
// Service
// ============================================================================

/// Owns every streaming subsystem and coordinates startup and shutdown.
pub struct StreamerService {
    /// Configuration the service was started with.
    config: ConfigFile,

    /// Backend the fetcher and manifest lookups read from.
    source: Arc<dyn PakSource>,

    /// On-disk chunk cache.
    store: Arc<ChunkStore>,

    /// Registered package manifests and their integrity state.
    registry: Arc<PakRegistry>,

    /// Consumer-facing read surface.
    view: PakView,

    /// Command channel into the fetch daemon.
    command_tx: mpsc::Sender<FetchCommand>,

    /// Broadcast channel for package lifecycle events.
    events: broadcast::Sender<StreamEvent>,

    /// Cancels the fetch daemon on shutdown.
    cancellation: CancellationToken,

    /// Join handle for the daemon task.
    daemon_handle: JoinHandle<()>,
}

impl StreamerService {
    /// Start the service with the source described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] when `mode = local` without a
    /// `local_source_directory`, [`ServiceError::Source`] when the HTTP
    /// client cannot be built, and [`ServiceError::Cache`] when the cache
    /// directory cannot be opened.
    pub async fn start(config: ConfigFile) -> Result<Self, ServiceError> {
        let source: Arc<dyn PakSource> = match config.streamer.mode {
            SourceMode::Remote => Arc::new(HttpPakSource::new(&config.streamer.server_host)?),
            SourceMode::Local => {
                let dir = config
                    .streamer
                    .local_source_directory
                    .clone()
                    .ok_or_else(|| ConfigFileError::InvalidValue {
                        section: "streamer".to_string(),
                        key: "local_source_directory".to_string(),
                        value: String::new(),
                        reason: "required when mode = local".to_string(),
                    })?;
                Arc::new(LocalPakSource::new(dir))
            }
        };
        Self::start_with_source(config, source).await
    }

    /// Start the service against an already-built source.
    ///
    /// Used by tests and by embedders that construct their own backend.
    pub async fn start_with_source(
        config: ConfigFile,
        source: Arc<dyn PakSource>,
    ) -> Result<Self, ServiceError> {
        info!(
            mode = %config.streamer.mode,
            cache_dir = %config.cache.directory.display(),
            capacity_bytes = config.cache.capacity_bytes,
            "Starting pak streamer service"
        );

        let store = Arc::new(
            ChunkStore::open(config.cache.directory.clone(), config.cache.capacity_bytes).await?,
        );

        // A capacity lowered since the last run is enforced before anything
        // new lands.
        let report = store.evict_if_over_capacity().await?;
        if report.entries_removed > 0 {
            info!(%report, "Trimmed cache to capacity at startup");
        }

        let registry = Arc::new(PakRegistry::new(Arc::clone(&store)));
        let inflight = Arc::new(InFlightTable::new());
        let fetcher = Arc::new(ChunkFetcher::new(
            Arc::clone(&source),
            config.retry_policy(),
        ));
        let (events, _) = event_channel();

        let (daemon, command_tx) = FetchDaemon::new(
            config.daemon_config(),
            fetcher,
            Arc::clone(&store),
            Arc::clone(&registry),
            inflight,
            events.clone(),
        );
        let cancellation = CancellationToken::new();
        let daemon_handle = tokio::spawn(daemon.run(cancellation.clone()));

        let view = PakView::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            command_tx.clone(),
            config.read_timeout(),
        );

        info!("Pak streamer service started");

        Ok(Self {
            config,
            source,
            store,
            registry,
            view,
            command_tx,
            events,
            cancellation,
            daemon_handle,
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // Package operations
    // ────────────────────────────────────────────────────────────────────

    /// Register a package by name, fetching its manifest from the source.
    ///
    /// Registering a name that is already registered with the same digest is
    /// a no-op returning the known manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Manifest`] for an invalid name or manifest,
    /// [`ServiceError::Source`] when the manifest cannot be fetched, and
    /// [`ServiceError::Registry`] when a different manifest already holds
    /// the name.
    pub async fn register_package(&self, name: &str) -> Result<PakManifest, ServiceError> {
        let pak = PakId::new(name)?;
        if let Some(manifest) = self.registry.manifest(&pak) {
            return Ok(manifest);
        }

        let manifest = self.source.manifest_for(&pak).await?;
        self.registry.register(manifest.clone())?;
        let _ = self.events.send(StreamEvent::Registered { pak: pak.clone() });
        info!(
            pak = %pak,
            total_bytes = manifest.total_length,
            assets = manifest.assets.len(),
            "Package registered"
        );
        Ok(manifest)
    }

    /// Register a package if needed and prefetch every non-resident byte.
    ///
    /// Returns once the work is queued; completion is signalled by the
    /// [`StreamEvent::Verified`] event (or observed via
    /// [`block_until_streamed`](Self::block_until_streamed)).
    pub async fn stream_package(&self, name: &str) -> Result<PakId, ServiceError> {
        let manifest = self.register_package(name).await?;
        let pak = manifest.name.clone();

        if manifest.total_length == 0 {
            self.verify_empty_package(&manifest)?;
            return Ok(pak);
        }

        // The daemon splits this into whatever is actually missing.
        self.view.prefetch(&pak, 0, manifest.total_length).await?;
        Ok(pak)
    }

    /// Stream a package and wait until it is fully resident and verified.
    ///
    /// Re-issues the prefetch after an integrity retry so the one permitted
    /// re-fetch actually happens even with no other readers.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Integrity`] (wrapped) when verification fails
    /// terminally and [`ReadError::Unregistered`] when the package is removed
    /// while waiting.
    pub async fn block_until_streamed(&self, name: &str) -> Result<(), ServiceError> {
        // Subscribe before checking state so completion cannot slip between
        // the check and the wait.
        let mut events = self.events.subscribe();
        let pak = self.stream_package(name).await?;

        loop {
            match self.registry.integrity(&pak) {
                Some(IntegrityState::Verified) => return Ok(()),
                Some(IntegrityState::Failed) => {
                    return Err(ReadError::Integrity { pak }.into());
                }
                Some(_) => {}
                None => return Err(ReadError::Unregistered { pak }.into()),
            }

            match events.recv().await {
                Ok(StreamEvent::Verified { pak: done }) if done == pak => return Ok(()),
                Ok(StreamEvent::IntegrityFailed { pak: failed }) if failed == pak => {
                    return Err(ReadError::Integrity { pak }.into());
                }
                Ok(StreamEvent::Unregistered { pak: gone }) if gone == pak => {
                    return Err(ReadError::Unregistered { pak }.into());
                }
                Ok(StreamEvent::IntegrityRetry { pak: retrying }) if retrying == pak => {
                    // The mismatched bytes were dropped; pull the body again.
                    if let Some(manifest) = self.registry.manifest(&pak) {
                        self.view.prefetch(&pak, 0, manifest.total_length).await?;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events; the state check at the top of the loop
                    // recovers.
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ReadError::ShuttingDown.into());
                }
            }
        }
    }

    /// Unregister a package, cancel its fetches, and drop its cached bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Registry`] when the package is not registered.
    pub async fn unregister_package(&self, name: &str) -> Result<(), ServiceError> {
        let pak = PakId::new(name)?;
        // Registry first: new reads fail fast while the daemon cleans up.
        self.registry.unregister(&pak)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(FetchCommand::Unregister {
                pak: pak.clone(),
                reply: reply_tx,
            })
            .await;
        if sent.is_ok() {
            let _ = reply_rx.await;
        }

        let _ = self.events.send(StreamEvent::Unregistered { pak: pak.clone() });
        info!(pak = %pak, "Package unregistered");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Accessors
    // ────────────────────────────────────────────────────────────────────

    /// Consumer-facing read surface.
    ///
    /// The view is cheap to clone and remains valid until shutdown.
    pub fn view(&self) -> PakView {
        self.view.clone()
    }

    /// Subscribe to package lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// The manifest registry.
    pub fn registry(&self) -> &Arc<PakRegistry> {
        &self.registry
    }

    /// The chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Cache occupancy counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Configuration the service was started with.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Token cancelled when shutdown begins.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    // ────────────────────────────────────────────────────────────────────
    // Shutdown
    // ────────────────────────────────────────────────────────────────────

    /// Shut down the service in order: stop the daemon, wait for it to
    /// drain, then persist the residency snapshot.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        info!("Shutting down pak streamer service");

        self.cancellation.cancel();
        if let Err(err) = self.daemon_handle.await {
            warn!(error = %err, "Fetch daemon task failed during shutdown");
        }
        info!("Fetch daemon stopped");

        self.store.save_snapshot().await?;
        info!("Residency snapshot saved");

        info!("Pak streamer service stopped");
        Ok(())
    }

    /// Verify a zero-length package without involving the fetch path.
    ///
    /// Nothing will ever be fetched for it, so the usual
    /// verify-on-final-chunk hook never runs.
    fn verify_empty_package(&self, manifest: &PakManifest) -> Result<(), ServiceError> {
        let pak = &manifest.name;
        if self.registry.integrity(pak) == Some(IntegrityState::Verified) {
            return Ok(());
        }

        let trivially_ok =
            !self.config.streamer.require_signed || manifest.digest == bytes_digest(&[]);
        if trivially_ok {
            self.store.mark_verified(pak, manifest.digest.clone());
            self.registry.mark_verified(pak);
            let _ = self.events.send(StreamEvent::Verified { pak: pak.clone() });
            return Ok(());
        }

        warn!(
            pak = %pak,
            digest = %manifest.digest,
            "Empty package can never match its manifest digest"
        );
        Err(ReadError::Integrity { pak: pak.clone() }.into())
    }
}

impl std::fmt::Debug for StreamerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamerService")
            .field("mode", &self.config.streamer.mode)
            .field("cache_dir", &self.config.cache.directory)
            .field("registered", &self.registry.registered().len())
            .finish_non_exhaustive()
    }
}
