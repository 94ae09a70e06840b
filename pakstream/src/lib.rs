//! Pakstream - on-demand streaming and caching for game pak packages
//!
//! This library serves byte ranges out of remote pak containers as if they
//! were local files: reads hit a disk-backed chunk cache, misses are fetched
//! over HTTP (or from a local directory) with retry, deduplication, and
//! priority scheduling, and whole packages are verified against their
//! manifest digest once fully resident.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides the facade:
//!
//! ```ignore
//! use pakstream::config::ConfigFile;
//! use pakstream::service::StreamerService;
//!
//! let config = ConfigFile::load()?;
//! let service = StreamerService::start(config).await?;
//!
//! // Stream a package and read from it while it downloads
//! service.stream_package("terrain_pack").await?;
//! let view = service.view();
//! let bytes = view.read(&pak, 4096, 65536).await?;
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod manifest;
pub mod range;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod view;

/// Version of the pakstream library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
