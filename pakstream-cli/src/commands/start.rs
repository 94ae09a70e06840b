//! Start command - run the streaming service until Ctrl+C.

use std::path::Path;

use clap::Args;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use pakstream::config::format_size;
use pakstream::logging::{default_log_dir, default_log_file, init_logging};
use pakstream::service::{StreamEvent, StreamerService};

use super::common::{load_config, source_description};
use crate::error::CliError;

/// Arguments for the start command.
#[derive(Debug, Args)]
pub struct StartArgs {
    /// Packages to start streaming immediately
    pub packages: Vec<String>,

    /// Skip writing a log file (stdout only via RUST_LOG)
    #[arg(long)]
    pub no_log_file: bool,
}

/// Run the start command.
pub async fn run(config_path: Option<&Path>, args: StartArgs) -> Result<(), CliError> {
    let _logging_guard = if args.no_log_file {
        None
    } else {
        Some(
            init_logging(default_log_dir(), default_log_file())
                .map_err(|e| CliError::LoggingInit(e.to_string()))?,
        )
    };

    let config = load_config(config_path)?;

    println!("Pakstream v{}", pakstream::VERSION);
    println!("================");
    println!();
    println!("Source: {}", source_description(&config));
    println!(
        "Cache:  {} (capacity {})",
        config.cache.directory.display(),
        format_size(config.cache.capacity_bytes)
    );
    println!();

    let service = StreamerService::start(config).await?;

    // Kick off streaming for each named package; a bad name or missing
    // package shouldn't stop the others.
    let mut started = 0usize;
    for name in &args.packages {
        match service.stream_package(name).await {
            Ok(pak) => {
                println!("Streaming {}", pak);
                started += 1;
            }
            Err(err) => eprintln!("Could not stream '{}': {}", name, err),
        }
    }
    if !args.packages.is_empty() && started == 0 {
        let err = CliError::Config("none of the requested packages could be streamed".to_string());
        // Tear the service down before reporting, or the daemon task leaks.
        let _ = service.shutdown().await;
        return Err(err);
    }

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let shutdown = CancellationToken::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("Received shutdown signal, stopping...");
        handler_token.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    // Report lifecycle transitions until shutdown.
    let mut events = service.events();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let stats = service.cache_stats();
    service.shutdown().await?;

    println!();
    println!("Session Summary");
    println!("---------------");
    println!("  Packages cached: {}", stats.package_count);
    println!(
        "  Bytes resident:  {} of {}",
        format_size(stats.resident_bytes),
        format_size(stats.capacity_bytes)
    );
    println!();
    println!("Service stopped.");
    Ok(())
}

fn print_event(event: &StreamEvent) {
    match event {
        StreamEvent::Registered { pak } => println!("[{}] registered", pak),
        StreamEvent::FullyResident { pak } => println!("[{}] all bytes resident", pak),
        StreamEvent::Verified { pak } => println!("[{}] verified", pak),
        StreamEvent::IntegrityRetry { pak } => {
            println!("[{}] digest mismatch, fetching again", pak)
        }
        StreamEvent::IntegrityFailed { pak } => println!("[{}] FAILED verification", pak),
        StreamEvent::Unregistered { pak } => println!("[{}] unregistered", pak),
    }
}
