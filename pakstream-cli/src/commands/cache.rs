//! Cache management CLI commands.

use std::path::Path;

use clap::Subcommand;

use pakstream::cache::ChunkStore;
use pakstream::config::format_size;

use super::common::load_config;
use crate::error::CliError;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache occupancy
    Stats,
    /// Remove every cached chunk and the residency snapshot
    Clear,
}

/// Run a cache subcommand.
pub async fn run(config_path: Option<&Path>, action: CacheAction) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let store =
        ChunkStore::open(config.cache.directory.clone(), config.cache.capacity_bytes).await?;

    match action {
        CacheAction::Stats => {
            let stats = store.stats();
            println!("Cache: {}", config.cache.directory.display());
            println!("  Packages: {}", stats.package_count);
            println!("  Chunks:   {}", stats.entry_count);
            println!(
                "  Size:     {} of {}",
                format_size(stats.resident_bytes),
                format_size(stats.capacity_bytes)
            );
            Ok(())
        }
        CacheAction::Clear => {
            println!("Clearing cache at: {}", config.cache.directory.display());
            let freed = store.clear().await?;
            println!("Freed {}", format_size(freed));
            Ok(())
        }
    }
}
