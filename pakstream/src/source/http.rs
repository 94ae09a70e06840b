//! Remote pak source backed by a content server speaking plain HTTP.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::{BoxFuture, PakSource, SourceError};
use crate::manifest::{PakId, PakManifest};
use crate::range::ChunkRange;

/// Per-request timeout applied by the HTTP client itself.
///
/// This is a transport deadline, distinct from the per-blocking-read timeout
/// the view enforces; a fetch may outlive the reader that wanted it.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Remote package source: ranged `GET`s against `{host}/{name}.pak` and
/// manifest fetches from `{host}/{name}.manifest.json`.
///
/// The connection pool is tuned for many small parallel range reads against
/// a single host: warm keepalive connections, no Nagle delay.
#[derive(Clone)]
pub struct HttpPakSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPakSource {
    /// Creates a source for the given server host.
    ///
    /// `host` is either a bare `host:port` (plain HTTP assumed, matching the
    /// default `127.0.0.1:8081` content server) or a full `http(s)://` URL.
    pub fn new(host: &str) -> Result<Self, SourceError> {
        Self::with_request_timeout(host, DEFAULT_REQUEST_TIMEOUT_SECS)
    }

    /// Creates a source with a custom per-request timeout.
    pub fn with_request_timeout(host: &str, timeout_secs: u64) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            // Keep connections warm for bursts of parallel range reads.
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| SourceError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(host),
        })
    }

    /// The normalized base URL requests are issued against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url, file_name)
    }

    async fn get(&self, url: &str, range: Option<ChunkRange>) -> Result<Bytes, SourceError> {
        trace!(url, range = range.map(|r| r.to_string()), "source GET starting");

        let mut request = self.client.get(url);
        if let Some(range) = range {
            // Inclusive HTTP range for the half-open chunk interval.
            request = request.header("Range", format!("bytes={}-{}", range.start, range.end - 1));
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    url,
                    error = %e,
                    is_connect = e.is_connect(),
                    is_timeout = e.is_timeout(),
                    "source request failed"
                );
                return Err(SourceError::Transport(format!("request failed: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "source returned error status");
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        match response.bytes().await {
            Ok(bytes) => {
                debug!(url, status = status.as_u16(), bytes = bytes.len(), "source GET complete");
                Ok(bytes)
            }
            Err(e) => {
                warn!(url, error = %e, "failed to read source response body");
                Err(SourceError::Transport(format!("failed to read response: {e}")))
            }
        }
    }
}

impl PakSource for HttpPakSource {
    fn read_range<'a>(
        &'a self,
        pak: &'a PakId,
        range: ChunkRange,
    ) -> BoxFuture<'a, Result<Bytes, SourceError>> {
        Box::pin(async move {
            if range.is_empty() {
                return Ok(Bytes::new());
            }
            let url = self.url_for(&pak.pak_file_name());
            self.get(&url, Some(range)).await
        })
    }

    fn manifest_for<'a>(&'a self, pak: &'a PakId) -> BoxFuture<'a, Result<PakManifest, SourceError>> {
        Box::pin(async move {
            let url = self.url_for(&pak.manifest_file_name());
            let body = self.get(&url, None).await?;
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

/// Prepends `http://` to bare `host:port` strings and trims trailing slashes.
fn normalize_base_url(host: &str) -> String {
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    with_scheme.trim_end_matches('/').to_string()
}
