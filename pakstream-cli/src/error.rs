//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! on stderr and a non-zero exit code.

use std::fmt;
use std::process;

use pakstream::cache::CacheError;
use pakstream::config::ConfigFileError;
use pakstream::service::ServiceError;
use pakstream::view::ReadError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Bad command-line usage or environment
    Config(String),
    /// Configuration file problem
    ConfigFile(ConfigFileError),
    /// Service operation failed
    Service(ServiceError),
    /// Read operation failed
    Read(ReadError),
    /// Cache store operation failed
    Cache(CacheError),
    /// Failed to write an output file
    FileWrite { path: String, error: std::io::Error },
}

impl CliError {
    /// Exit the process with an error message and a non-zero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Service(ServiceError::Source(_)) = self {
            eprintln!();
            eprintln!("Check that the pak server is reachable:");
            eprintln!("  - server_host in config.ini points at a running server");
            eprintln!("  - or use mode = local with a local_source_directory");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::ConfigFile(e) => write!(f, "{}", e),
            CliError::Service(e) => write!(f, "{}", e),
            CliError::Read(e) => write!(f, "Read failed: {}", e),
            CliError::Cache(e) => write!(f, "Cache error: {}", e),
            CliError::FileWrite { path, error } => {
                write!(f, "Failed to write file '{}': {}", path, error)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::ConfigFile(e) => Some(e),
            CliError::Service(e) => Some(e),
            CliError::Read(e) => Some(e),
            CliError::Cache(e) => Some(e),
            CliError::FileWrite { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::ConfigFile(e)
    }
}

impl From<ServiceError> for CliError {
    fn from(e: ServiceError) -> Self {
        CliError::Service(e)
    }
}

impl From<ReadError> for CliError {
    fn from(e: ReadError) -> Self {
        CliError::Read(e)
    }
}

impl From<CacheError> for CliError {
    fn from(e: CacheError) -> Self {
        CliError::Cache(e)
    }
}
