//! Pakstream CLI - command-line interface for the pak streaming service.
//!
//! Subcommands:
//! - `start`  - run the streaming service until Ctrl+C
//! - `fetch`  - one-shot ranged read from a package
//! - `cache`  - cache maintenance (stats, clear)
//! - `config` - view or create the configuration file

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::cache::CacheAction;
use commands::config::ConfigAction;
use commands::fetch::FetchArgs;
use commands::start::StartArgs;

#[derive(Debug, Parser)]
#[command(name = "pakstream")]
#[command(version = pakstream::VERSION)]
#[command(about = "On-demand streaming of pak content packages", long_about = None)]
struct Cli {
    /// Path to an alternate config file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the streaming service until Ctrl+C
    Start(StartArgs),

    /// Fetch a byte range from a package and exit
    Fetch(FetchArgs),

    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// View or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config;

    let result = match cli.command {
        Commands::Start(args) => commands::start::run(config_path.as_deref(), args).await,
        Commands::Fetch(args) => commands::fetch::run(config_path.as_deref(), args).await,
        Commands::Cache { action } => commands::cache::run(config_path.as_deref(), action).await,
        Commands::Config { action } => commands::config::run(config_path.as_deref(), action),
    };

    if let Err(err) = result {
        err.exit();
    }
}
