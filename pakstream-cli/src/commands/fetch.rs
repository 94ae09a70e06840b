//! Fetch command - one-shot ranged read from a package.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Args;

use pakstream::cache::bytes_digest;
use pakstream::config::format_size;
use pakstream::service::StreamerService;

use super::common::load_config;
use crate::error::CliError;

/// Arguments for the fetch command.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Package to read from
    pub package: String,

    /// Byte offset to start reading at
    #[arg(long, default_value_t = 0, conflicts_with = "asset")]
    pub offset: u64,

    /// Number of bytes to read (defaults to the rest of the package)
    #[arg(long, conflicts_with = "asset")]
    pub length: Option<u64>,

    /// Read a named asset instead of a raw range
    #[arg(long)]
    pub asset: Option<String>,

    /// Write the fetched bytes to this file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Run the fetch command.
pub async fn run(config_path: Option<&Path>, args: FetchArgs) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let service = StreamerService::start(config).await?;

    let result = fetch(&service, &args).await;
    // Shut down regardless of the read outcome so the cache snapshot lands.
    let shutdown = service.shutdown().await;

    result?;
    shutdown?;
    Ok(())
}

async fn fetch(service: &StreamerService, args: &FetchArgs) -> Result<(), CliError> {
    let manifest = service.register_package(&args.package).await?;
    let view = service.view();
    let started = Instant::now();

    let bytes = match &args.asset {
        Some(asset) => view.read_asset(&manifest.name, asset).await?,
        None => {
            let length = args
                .length
                .unwrap_or_else(|| manifest.total_length.saturating_sub(args.offset));
            view.read(&manifest.name, args.offset, length).await?
        }
    };
    let elapsed = started.elapsed();

    match &args.output {
        Some(path) => {
            std::fs::write(path, &bytes).map_err(|error| CliError::FileWrite {
                path: path.display().to_string(),
                error,
            })?;
            println!(
                "Wrote {} to {} in {:.2}s",
                format_size(bytes.len() as u64),
                path.display(),
                elapsed.as_secs_f64()
            );
        }
        None => {
            println!("Package: {}", manifest.name);
            println!("Fetched: {} in {:.2}s", format_size(bytes.len() as u64), elapsed.as_secs_f64());
            println!("SHA-256: {}", bytes_digest(&bytes));
        }
    }
    Ok(())
}
