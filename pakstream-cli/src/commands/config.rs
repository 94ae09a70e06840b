//! Configuration management CLI commands.

use std::path::Path;

use clap::Subcommand;

use pakstream::config::{config_file_path, format_size, ConfigFile};

use super::common::load_config;
use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Create the default config file if it doesn't exist
    Init,
}

/// Run a config subcommand.
pub fn run(config_path: Option<&Path>, action: ConfigAction) -> Result<(), CliError> {
    match action {
        ConfigAction::Show => run_show(config_path),
        ConfigAction::Init => run_init(),
    }
}

/// Print the effective configuration, including defaults.
fn run_show(config_path: Option<&Path>) -> Result<(), CliError> {
    let config = load_config(config_path)?;

    println!("[streamer]");
    println!("  server_host = {}", config.streamer.server_host);
    println!("  mode = {}", config.streamer.mode);
    match &config.streamer.local_source_directory {
        Some(dir) => println!("  local_source_directory = {}", dir.display()),
        None => println!("  local_source_directory = (not set)"),
    }
    println!("  require_signed = {}", config.streamer.require_signed);
    println!();
    println!("[cache]");
    println!("  directory = {}", config.cache.directory.display());
    println!("  capacity = {}", format_size(config.cache.capacity_bytes));
    println!();
    println!("[fetch]");
    println!("  max_concurrent = {}", config.fetch.max_concurrent);
    println!("  retry_limit = {}", config.fetch.retry_limit);
    println!("  timeout_secs = {}", config.fetch.timeout_secs);

    Ok(())
}

/// Create the default config file.
fn run_init() -> Result<(), CliError> {
    let path = config_file_path();
    if path.exists() {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }

    let created = ConfigFile::ensure_exists()?;
    println!("Created default config at: {}", created.display());
    Ok(())
}
