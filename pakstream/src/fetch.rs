//! Chunk fetching with bounded retry.
//!
//! The [`ChunkFetcher`] performs one ranged read against the package source
//! and owns the retry loop around it. Retry is strictly per-fetch: waiters
//! attached to a fetch never observe individual attempts, only the eventual
//! success or the terminal [`FetchError`]. The fetcher also enforces the
//! byte-count contract — a source handing back more or fewer bytes than the
//! requested range is a transport-class failure, not data.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::manifest::PakId;
use crate::range::ChunkRange;
use crate::source::{PakSource, SourceError};

// =============================================================================
// Retry Policy Constants
// =============================================================================

/// Default initial delay for exponential backoff (100ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum delay for exponential backoff (30 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// How a fetch handles transient transport failures.
///
/// Controls automatic retry of ranged reads that fail due to transient
/// issues (connection resets, timeouts, overloaded server). Non-transient
/// failures bypass the policy entirely.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// No retries - fail immediately on error.
    None,

    /// Fixed number of retries with constant delay between attempts.
    Fixed {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay between retry attempts.
        delay: Duration,
    },

    /// Exponential backoff with configurable parameters.
    ///
    /// The delay grows by `multiplier` after each failed attempt, up to a
    /// maximum delay. This is the recommended policy for network operations
    /// to avoid hammering a server that is already struggling.
    ExponentialBackoff {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Initial delay after the first failure.
        initial_delay: Duration,
        /// Maximum delay cap (delay won't exceed this).
        max_delay: Duration,
        /// Multiplier applied to delay after each failure (typically 2.0).
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Creates an exponential backoff policy with sensible defaults.
    ///
    /// Uses:
    /// - Initial delay: 100ms ([`DEFAULT_INITIAL_DELAY_MS`])
    /// - Max delay: 30 seconds ([`DEFAULT_MAX_DELAY_SECS`])
    /// - Multiplier: 2.0 ([`DEFAULT_BACKOFF_MULTIPLIER`])
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including initial)
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Creates a fixed retry policy.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including initial)
    /// * `delay` - Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Maps the configured retry *limit* (number of retries after the first
    /// attempt) onto a policy: zero means no retries at all.
    pub fn for_retry_limit(retry_limit: u32) -> Self {
        if retry_limit == 0 {
            Self::None
        } else {
            Self::exponential(retry_limit + 1)
        }
    }

    /// Calculates the delay for a given attempt number.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number (1-based, where 1 is the first attempt)
    ///
    /// # Returns
    ///
    /// The delay to wait before the next attempt, or `None` if no more
    /// attempts are allowed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_attempts, delay } => {
                if attempt < *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt < *max_attempts {
                    // initial_delay * multiplier^(attempt-1), capped
                    let factor = multiplier.powi((attempt - 1) as i32);
                    let delay_ms = initial_delay.as_millis() as f64 * factor;
                    let delay =
                        Duration::from_millis(delay_ms.min(max_delay.as_millis() as f64) as u64);
                    Some(delay.min(*max_delay))
                } else {
                    None
                }
            }
        }
    }

    /// Returns the maximum number of attempts for this policy.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}

// =============================================================================
// Fetch errors
// =============================================================================

/// Terminal failure of one chunk fetch, after any retries.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The transport kept failing (or failed non-transiently).
    #[error("fetch of {pak} {range} failed after {attempts} attempt(s): {source}")]
    Transport {
        /// Package being fetched.
        pak: PakId,
        /// Range being fetched.
        range: ChunkRange,
        /// Attempts actually made.
        attempts: u32,
        /// Last transport error observed.
        #[source]
        source: SourceError,
    },

    /// The source delivered a byte count different from the request.
    #[error("short read for {pak} {range}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        /// Package being fetched.
        pak: PakId,
        /// Range being fetched.
        range: ChunkRange,
        /// Bytes requested.
        wanted: u64,
        /// Bytes delivered.
        got: u64,
    },
}

impl FetchError {
    /// Attempts made before this error became terminal.
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Transport { attempts, .. } => *attempts,
            FetchError::ShortRead { .. } => 1,
        }
    }
}

// =============================================================================
// ChunkFetcher
// =============================================================================

/// Issues ranged reads against a [`PakSource`] with bounded retry.
#[derive(Clone)]
pub struct ChunkFetcher {
    source: Arc<dyn PakSource>,
    retry: RetryPolicy,
}

impl ChunkFetcher {
    /// Creates a fetcher over `source` with the given retry policy.
    pub fn new(source: Arc<dyn PakSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    /// Fetches exactly the bytes of `range` from the package body.
    ///
    /// Transient transport failures and short reads are retried per the
    /// policy; non-transient failures surface immediately.
    ///
    /// # Errors
    ///
    /// [`FetchError::Transport`] once the transport is out of attempts, or
    /// [`FetchError::ShortRead`] when the final attempt delivered the wrong
    /// byte count.
    pub async fn fetch(&self, pak: &PakId, range: ChunkRange) -> Result<Bytes, FetchError> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let mut attempt: u32 = 1;
        loop {
            let failure = match self.source.read_range(pak, range).await {
                Ok(bytes) if bytes.len() as u64 == range.len() => {
                    debug!(pak = %pak, range = %range, attempt, "chunk fetched");
                    return Ok(bytes);
                }
                Ok(bytes) => FetchError::ShortRead {
                    pak: pak.clone(),
                    range,
                    wanted: range.len(),
                    got: bytes.len() as u64,
                },
                Err(source) => FetchError::Transport {
                    pak: pak.clone(),
                    range,
                    attempts: attempt,
                    source,
                },
            };

            let transient = match &failure {
                FetchError::Transport { source, .. } => source.is_transient(),
                // A short read is worth another try; the next attempt may
                // see the full body.
                FetchError::ShortRead { .. } => true,
            };

            match self.retry.delay_for_attempt(attempt).filter(|_| transient) {
                Some(delay) => {
                    warn!(
                        pak = %pak,
                        range = %range,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "chunk fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(pak = %pak, range = %range, attempt, error = %failure, "chunk fetch gave up");
                    return Err(failure);
                }
            }
        }
    }

    /// The retry policy this fetcher applies.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::MockPakSource;

    fn fetcher_with(source: MockPakSource, retry: RetryPolicy) -> (ChunkFetcher, Arc<MockPakSource>) {
        let source = Arc::new(source);
        (ChunkFetcher::new(source.clone(), retry), source)
    }

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for_attempt(1), None);
    }

    #[test]
    fn test_retry_policy_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(3), None); // No more retries
    }

    #[test]
    fn test_retry_policy_exponential() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };

        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for_attempt(4), None);
    }

    #[test]
    fn test_retry_policy_exponential_respects_max_delay() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };

        assert!(policy.delay_for_attempt(5).unwrap() <= Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_from_limit() {
        assert_eq!(RetryPolicy::for_retry_limit(0), RetryPolicy::None);

        let policy = RetryPolicy::for_retry_limit(3);
        // Three retries on top of the initial attempt.
        assert_eq!(policy.max_attempts(), 4);
        if let RetryPolicy::ExponentialBackoff {
            initial_delay,
            max_delay,
            multiplier,
            ..
        } = policy
        {
            assert_eq!(initial_delay, Duration::from_millis(DEFAULT_INITIAL_DELAY_MS));
            assert_eq!(max_delay, Duration::from_secs(DEFAULT_MAX_DELAY_SECS));
            assert_eq!(multiplier, DEFAULT_BACKOFF_MULTIPLIER);
        } else {
            panic!("Expected ExponentialBackoff");
        }
    }

    #[tokio::test]
    async fn test_fetch_success_first_attempt() {
        let body: Vec<u8> = (0u8..100).collect();
        let (fetcher, source) =
            fetcher_with(MockPakSource::new().with_package("core", body.clone()), RetryPolicy::None);
        let pak = PakId::new("core").unwrap();

        let bytes = fetcher.fetch(&pak, ChunkRange::new(10, 30)).await.unwrap();
        assert_eq!(&bytes[..], &body[10..30]);
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_then_succeeds() {
        let source = MockPakSource::new().with_package("core", vec![5u8; 64]);
        source.fail_reads(3);
        let (fetcher, source) =
            fetcher_with(source, RetryPolicy::fixed(4, Duration::from_millis(1)));
        let pak = PakId::new("core").unwrap();

        let bytes = fetcher.fetch(&pak, ChunkRange::new(0, 64)).await.unwrap();
        assert_eq!(bytes.len(), 64);
        // Three failures observed, then the success.
        assert_eq!(source.read_count(), 4);
    }

    #[tokio::test]
    async fn test_fetch_exhausts_retries() {
        let source = MockPakSource::new().with_package("core", vec![5u8; 64]);
        source.fail_reads(10);
        let (fetcher, source) =
            fetcher_with(source, RetryPolicy::fixed(3, Duration::from_millis(1)));
        let pak = PakId::new("core").unwrap();

        let err = fetcher.fetch(&pak, ChunkRange::new(0, 64)).await.unwrap_err();
        match err {
            FetchError::Transport { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Transport, got {other}"),
        }
        assert_eq!(source.read_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_non_transient_fails_immediately() {
        // No package registered: every read is a 404, which is not transient.
        let (fetcher, source) = fetcher_with(
            MockPakSource::new(),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        );
        let pak = PakId::new("ghost").unwrap();

        let err = fetcher.fetch(&pak, ChunkRange::new(0, 8)).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { attempts: 1, .. }));
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_short_read_surfaces() {
        // Body is 4 bytes; asking for 10 keeps coming back short.
        let (fetcher, source) =
            fetcher_with(MockPakSource::new().with_package("tiny", vec![1, 2, 3, 4]), RetryPolicy::None);
        let pak = PakId::new("tiny").unwrap();

        let err = fetcher.fetch(&pak, ChunkRange::new(0, 10)).await.unwrap_err();
        match err {
            FetchError::ShortRead { wanted, got, .. } => {
                assert_eq!(wanted, 10);
                assert_eq!(got, 4);
            }
            other => panic!("expected ShortRead, got {other}"),
        }
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_empty_range_is_free() {
        let (fetcher, source) = fetcher_with(MockPakSource::new(), RetryPolicy::None);
        let pak = PakId::new("core").unwrap();

        let bytes = fetcher.fetch(&pak, ChunkRange::new(5, 5)).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(source.read_count(), 0);
    }
}
