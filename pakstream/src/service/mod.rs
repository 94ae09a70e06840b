//! Package streaming service.
//!
//! [`StreamerService`] is the top-level handle: it wires the source, cache,
//! registry, and fetch daemon together and exposes package-level operations.
//! [`StreamEvent`] is the broadcast stream of package lifecycle transitions
//! that consumers subscribe to.

pub mod events;
mod streamer;

pub use events::{event_channel, StreamEvent, EVENT_CHANNEL_CAPACITY};
pub use streamer::{ServiceError, StreamerService};
