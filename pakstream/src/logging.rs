//! Logging infrastructure for the streamer.
//!
//! Structured logging with dual output:
//! - `logs/pakstream.log` (cleared on session start), written through a
//!   non-blocking appender so fetch workers never stall on disk
//! - stdout for CLI tailing
//! - Filterable via the `RUST_LOG` environment variable, default `info`

use std::fs;
use std::io;
use std::path::Path;

use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking log writer alive.
///
/// Dropping this guard flushes and closes the log file writer, so hold it
/// for the lifetime of the process.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the logging system.
///
/// Creates the log directory if needed, truncates the previous log file, and
/// sets up output to both the file and stdout.
///
/// # Arguments
///
/// * `log_dir` - directory the log file lives in (e.g., "logs")
/// * `log_file` - file name within it (e.g., "pakstream.log")
///
/// # Returns
///
/// A [`LoggingGuard`] that must be kept alive for file logging to work.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the log file
/// cannot be truncated.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    // Truncate rather than append so each run starts with a clean log.
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let timer = LocalTime::new(Rfc3339);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_timer(timer.clone())
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_timer(timer)
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Default log directory relative to the working directory.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "pakstream.log"
}
