//! Lifecycle events broadcast by the streaming service.
//!
//! Subscribers get a best-effort feed of package lifecycle transitions.
//! Events are informational; correctness never depends on observing them,
//! and a slow subscriber may miss events (broadcast semantics).

use tokio::sync::broadcast;

use crate::manifest::PakId;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A package lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The package was registered and can be streamed.
    Registered { pak: PakId },

    /// Every byte of the package body is resident in the cache.
    FullyResident { pak: PakId },

    /// The package body hashed to its manifest digest.
    Verified { pak: PakId },

    /// Verification failed once; the cache was dropped and the package
    /// will be fetched again.
    IntegrityRetry { pak: PakId },

    /// Verification failed twice; the package is unusable until
    /// re-registered.
    IntegrityFailed { pak: PakId },

    /// The package was unregistered.
    Unregistered { pak: PakId },
}

impl StreamEvent {
    /// The package this event concerns.
    pub fn pak(&self) -> &PakId {
        match self {
            Self::Registered { pak }
            | Self::FullyResident { pak }
            | Self::Verified { pak }
            | Self::IntegrityRetry { pak }
            | Self::IntegrityFailed { pak }
            | Self::Unregistered { pak } => pak,
        }
    }
}

/// Create the event channel used by the service and fetch daemon.
pub fn event_channel() -> (broadcast::Sender<StreamEvent>, broadcast::Receiver<StreamEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
