//! Local-directory pak source for offline runs and tests.

use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::trace;

use super::{BoxFuture, PakSource, SourceError};
use crate::manifest::{PakId, PakManifest};
use crate::range::ChunkRange;

/// Package source reading `{dir}/{name}.pak` and `{dir}/{name}.manifest.json`
/// from the local filesystem.
///
/// Behaves exactly like the remote source from the core's point of view:
/// ranged reads may come back short (truncated pak on disk) and the chunk
/// fetcher is the one that notices.
#[derive(Debug, Clone)]
pub struct LocalPakSource {
    dir: PathBuf,
}

impl LocalPakSource {
    /// Creates a source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory packages are read from.
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl PakSource for LocalPakSource {
    fn read_range<'a>(
        &'a self,
        pak: &'a PakId,
        range: ChunkRange,
    ) -> BoxFuture<'a, Result<Bytes, SourceError>> {
        Box::pin(async move {
            if range.is_empty() {
                return Ok(Bytes::new());
            }
            let path = self.dir.join(pak.pak_file_name());
            trace!(path = %path.display(), range = %range, "local range read");

            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(range.start)).await?;

            // Stop at EOF rather than erroring; a truncated pak surfaces as a
            // short read in the fetcher.
            let mut buf = Vec::with_capacity(range.len() as usize);
            file.take(range.len()).read_to_end(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }

    fn manifest_for<'a>(&'a self, pak: &'a PakId) -> BoxFuture<'a, Result<PakManifest, SourceError>> {
        Box::pin(async move {
            let path = self.dir.join(pak.manifest_file_name());
            let body = tokio::fs::read(&path).await?;
            let manifest = PakManifest::from_json(&body)?;
            if manifest.name != *pak {
                return Err(SourceError::ManifestMismatch {
                    requested: pak.to_string(),
                    actual: manifest.name.to_string(),
                });
            }
            Ok(manifest)
        })
    }
}
