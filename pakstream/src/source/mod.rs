//! Package sources: where pak bytes and manifests come from.
//!
//! The streaming core talks to its content backend through the narrow
//! [`PakSource`] capability interface: ranged reads of a pak body plus
//! manifest retrieval. Backends own all connection lifecycle; the core only
//! supplies offsets and lengths. Two implementations ship here:
//!
//! - [`HttpPakSource`] — ranged `GET`s against a content server
//!   (`{host}/{name}.pak`), the normal remote mode.
//! - [`LocalPakSource`] — reads pak files straight from a local directory,
//!   used for offline runs and tests.

mod http;
mod local;

pub use http::HttpPakSource;
pub use local::LocalPakSource;

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::manifest::{ManifestError, PakId, PakManifest};
use crate::range::ChunkRange;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by a package source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport-level failure: connect, timeout, interrupted body.
    #[error("request failed: {0}")]
    Transport(String),

    /// Server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Status code returned by the server.
        status: u16,
        /// Request URL, for the logs.
        url: String,
    },

    /// Local-mode filesystem failure.
    #[error("local source I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest payload failed to decode or validate.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A manifest was served under the wrong package name.
    #[error("manifest for {requested} names package {actual}")]
    ManifestMismatch {
        /// Package the caller asked for.
        requested: String,
        /// Package named inside the returned manifest.
        actual: String,
    },
}

impl SourceError {
    /// Whether retrying the same request can reasonably succeed.
    ///
    /// Connection problems, interrupted bodies, server overload (429) and
    /// 5xx responses are transient. Client errors and malformed manifests
    /// are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transport(_) | SourceError::Io(_) => true,
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::Manifest(_) | SourceError::ManifestMismatch { .. } => false,
        }
    }
}

/// Capability interface over a pak content backend.
///
/// Object-safe so the engine can hold an `Arc<dyn PakSource>` and swap
/// backends (remote server, local directory, test doubles) without touching
/// the streaming core.
pub trait PakSource: Send + Sync {
    /// Reads `range` from the package's pak body.
    ///
    /// Implementations return exactly the bytes the backend handed over;
    /// length verification against the requested range happens in the chunk
    /// fetcher, so a short or over-long body is returned as-is here.
    fn read_range<'a>(
        &'a self,
        pak: &'a PakId,
        range: ChunkRange,
    ) -> BoxFuture<'a, Result<Bytes, SourceError>>;

    /// Retrieves and validates the package's manifest.
    fn manifest_for<'a>(&'a self, pak: &'a PakId) -> BoxFuture<'a, Result<PakManifest, SourceError>>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted in-memory source shared by the scheduler, view, and service
    /// tests: serves from fixed package bodies, counts ranged reads, and can
    /// inject failures and latency.
    pub struct MockPakSource {
        bodies: HashMap<PakId, Vec<u8>>,
        manifests: HashMap<PakId, PakManifest>,
        /// Errors handed out before any read succeeds, front first.
        scripted_failures: Mutex<VecDeque<SourceError>>,
        /// Artificial delay applied to every ranged read.
        read_delay: Mutex<Duration>,
        read_calls: AtomicUsize,
        read_log: Mutex<Vec<(PakId, ChunkRange)>>,
    }

    impl MockPakSource {
        pub fn new() -> Self {
            Self {
                bodies: HashMap::new(),
                manifests: HashMap::new(),
                scripted_failures: Mutex::new(VecDeque::new()),
                read_delay: Mutex::new(Duration::ZERO),
                read_calls: AtomicUsize::new(0),
                read_log: Mutex::new(Vec::new()),
            }
        }

        /// Adds a package whose manifest digest matches its body.
        pub fn with_package(mut self, name: &str, body: Vec<u8>) -> Self {
            let id = PakId::new(name).unwrap();
            let manifest = PakManifest {
                name: id.clone(),
                total_length: body.len() as u64,
                digest: hex_sha256(&body),
                assets: Vec::new(),
            };
            self.manifests.insert(id.clone(), manifest);
            self.bodies.insert(id, body);
            self
        }

        /// Adds a package whose manifest advertises a digest its body will
        /// never hash to, for integrity-failure tests.
        pub fn with_corrupt_package(mut self, name: &str, body: Vec<u8>) -> Self {
            let id = PakId::new(name).unwrap();
            let manifest = PakManifest {
                name: id.clone(),
                total_length: body.len() as u64,
                digest: "0".repeat(64),
                assets: Vec::new(),
            };
            self.manifests.insert(id.clone(), manifest);
            self.bodies.insert(id, body);
            self
        }

        pub fn with_assets(mut self, name: &str, assets: Vec<crate::manifest::AssetEntry>) -> Self {
            let id = PakId::new(name).unwrap();
            if let Some(manifest) = self.manifests.get_mut(&id) {
                manifest.assets = assets;
            }
            self
        }

        /// Queues transport failures served before reads start succeeding.
        pub fn fail_reads(&self, count: usize) {
            let mut failures = self.scripted_failures.lock();
            for _ in 0..count {
                failures.push_back(SourceError::Transport("injected failure".into()));
            }
        }

        pub fn set_read_delay(&self, delay: Duration) {
            *self.read_delay.lock() = delay;
        }

        /// Total ranged reads attempted, including scripted failures.
        pub fn read_count(&self) -> usize {
            self.read_calls.load(Ordering::SeqCst)
        }

        /// Every `(package, range)` pair that reached the source.
        pub fn read_log(&self) -> Vec<(PakId, ChunkRange)> {
            self.read_log.lock().clone()
        }
    }

    impl PakSource for MockPakSource {
        fn read_range<'a>(
            &'a self,
            pak: &'a PakId,
            range: ChunkRange,
        ) -> BoxFuture<'a, Result<Bytes, SourceError>> {
            Box::pin(async move {
                self.read_calls.fetch_add(1, Ordering::SeqCst);
                self.read_log.lock().push((pak.clone(), range));

                let delay = *self.read_delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                if let Some(error) = self.scripted_failures.lock().pop_front() {
                    return Err(error);
                }

                let body = self.bodies.get(pak).ok_or_else(|| SourceError::Status {
                    status: 404,
                    url: pak.pak_file_name(),
                })?;
                let start = (range.start as usize).min(body.len());
                let end = (range.end as usize).min(body.len());
                Ok(Bytes::copy_from_slice(&body[start..end]))
            })
        }

        fn manifest_for<'a>(
            &'a self,
            pak: &'a PakId,
        ) -> BoxFuture<'a, Result<PakManifest, SourceError>> {
            Box::pin(async move {
                self.manifests
                    .get(pak)
                    .cloned()
                    .ok_or_else(|| SourceError::Status {
                        status: 404,
                        url: pak.manifest_file_name(),
                    })
            })
        }
    }

    /// Lowercase hex SHA-256, for building matching manifests in tests.
    pub fn hex_sha256(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    #[test]
    fn test_transient_classification() {
        assert!(SourceError::Transport("boom".into()).is_transient());
        assert!(SourceError::Status { status: 503, url: "u".into() }.is_transient());
        assert!(SourceError::Status { status: 429, url: "u".into() }.is_transient());
        assert!(!SourceError::Status { status: 404, url: "u".into() }.is_transient());
        assert!(!SourceError::ManifestMismatch {
            requested: "a".into(),
            actual: "b".into()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn test_mock_source_serves_ranges() {
        let source = MockPakSource::new().with_package("core", (0u8..200).collect());
        let pak = PakId::new("core").unwrap();

        let bytes = source
            .read_range(&pak, ChunkRange::new(10, 20))
            .await
            .unwrap();
        assert_eq!(&bytes[..], &(10u8..20).collect::<Vec<_>>()[..]);
        assert_eq!(source.read_count(), 1);
        assert_eq!(source.read_log(), vec![(pak, ChunkRange::new(10, 20))]);
    }

    #[tokio::test]
    async fn test_mock_source_scripted_failures_then_success() {
        let source = MockPakSource::new().with_package("core", vec![7u8; 64]);
        source.fail_reads(2);
        let pak = PakId::new("core").unwrap();
        let range = ChunkRange::new(0, 64);

        assert!(source.read_range(&pak, range).await.is_err());
        assert!(source.read_range(&pak, range).await.is_err());
        assert!(source.read_range(&pak, range).await.is_ok());
        assert_eq!(source.read_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_source_unknown_package() {
        let source = MockPakSource::new();
        let pak = PakId::new("ghost").unwrap();
        let result = source.manifest_for(&pak).await;
        assert!(matches!(result, Err(SourceError::Status { status: 404, .. })));
    }
}
