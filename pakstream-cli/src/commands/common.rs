//! Shared helpers for CLI commands.

use std::path::Path;

use pakstream::config::{ConfigFile, SourceMode};

use crate::error::CliError;

/// Load configuration, honoring an explicit `--config` path.
///
/// An explicit path that does not exist is an error (the user asked for that
/// file specifically); without one, a missing default file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    match path {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            Ok(ConfigFile::load_from(path)?)
        }
        None => Ok(ConfigFile::load()?),
    }
}

/// Human description of where pak bytes come from, for banners.
pub fn source_description(config: &ConfigFile) -> String {
    match config.streamer.mode {
        SourceMode::Remote => format!("pak server {}", config.streamer.server_host),
        SourceMode::Local => match &config.streamer.local_source_directory {
            Some(dir) => format!("local directory {}", dir.display()),
            None => "local directory (unset)".to_string(),
        },
    }
}
