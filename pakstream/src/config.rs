//! Configuration file handling for `~/.config/pakstream/config.ini`.
//!
//! Loads and saves user configuration with sensible defaults. A missing file
//! yields [`ConfigFile::default()`]; a present file is validated strictly, so
//! a mistyped section or key name fails loudly instead of being silently
//! ignored.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::fetch::RetryPolicy;
use crate::scheduler::{FetchDaemonConfig, DEFAULT_MAX_CONCURRENT_FETCHES};

/// Default pak server address for remote mode.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1:8081";

/// Default cache capacity in bytes (4 GB).
pub const DEFAULT_CACHE_CAPACITY: u64 = 4 * 1024 * 1024 * 1024;

/// Default number of retries after a failed chunk fetch.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default deadline in seconds for a blocking read.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Known sections and the keys each accepts. Anything else in the file is a
/// load error.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "streamer",
        &[
            "server_host",
            "mode",
            "local_source_directory",
            "require_signed",
        ],
    ),
    ("cache", &["directory", "capacity"]),
    ("fetch", &["max_concurrent", "retry_limit", "timeout_secs"]),
];

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to write the config file or create its directory
    #[error("Failed to write config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to read or parse the config file
    #[error("Failed to read config file: {0}")]
    Parse(#[from] ini::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

/// Where pak bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Ranged HTTP reads against a pak server.
    #[default]
    Remote,
    /// Reads from a local directory of pak files.
    Local,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Remote => write!(f, "remote"),
            SourceMode::Local => write!(f, "local"),
        }
    }
}

/// Complete configuration loaded from config.ini.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Streamer settings
    pub streamer: StreamerSettings,
    /// Cache settings
    pub cache: CacheSettings,
    /// Fetch settings
    pub fetch: FetchSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            streamer: StreamerSettings::default(),
            cache: CacheSettings::default(),
            fetch: FetchSettings::default(),
        }
    }
}

/// Streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    /// Pak server address (host:port or full origin) for remote mode
    pub server_host: String,
    /// Source mode: remote pak server or local directory
    pub mode: SourceMode,
    /// Directory holding pak and manifest files when mode = local
    pub local_source_directory: Option<PathBuf>,
    /// Whether package digests must match their manifest
    pub require_signed: bool,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            mode: SourceMode::Remote,
            local_source_directory: None,
            require_signed: true,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Directory for chunk files and the residency snapshot
    pub directory: PathBuf,
    /// Maximum bytes of cached pak data kept on disk
    pub capacity_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            capacity_bytes: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Maximum number of chunk fetches in flight at once
    pub max_concurrent: usize,
    /// Retries after a failed chunk fetch before giving up
    pub retry_limit: u32,
    /// Seconds a blocking read waits before returning a timeout
    pub timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_FETCHES,
            retry_limit: DEFAULT_RETRY_LIMIT,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl ConfigFile {
    /// Load configuration from the default path
    /// (`~/.config/pakstream/config.ini`).
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load() -> Result<Self, ConfigFileError> {
        let path = config_file_path();
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        parse_ini(&ini)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<(), ConfigFileError> {
        let path = config_file_path();
        self.save_to(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }

    /// Create the default config file if it doesn't exist.
    ///
    /// Returns the path to the config file.
    pub fn ensure_exists() -> Result<PathBuf, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            Self::default().save_to(&path)?;
        }
        Ok(path)
    }

    /// Build the fetch daemon configuration described by this file.
    pub fn daemon_config(&self) -> FetchDaemonConfig {
        FetchDaemonConfig {
            max_concurrent_fetches: self.fetch.max_concurrent,
            verify_digests: self.streamer.require_signed,
            ..FetchDaemonConfig::default()
        }
    }

    /// Retry policy for chunk fetches.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::for_retry_limit(self.fetch.retry_limit)
    }

    /// Deadline applied to each blocking read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    /// Convert to a commented INI string for saving.
    fn to_config_string(&self) -> String {
        let local_source_directory = self
            .streamer
            .local_source_directory
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let require_signed = if self.streamer.require_signed {
            "true"
        } else {
            "false"
        };

        format!(
            r#"[streamer]
; Pak server address for remote mode (host:port or full origin)
server_host = {}
; Source mode:
;   remote - ranged HTTP reads against the pak server
;   local  - reads from a local directory of pak files
mode = {}
; Directory holding <name>.pak and <name>.manifest.json when mode = local
local_source_directory = {}
; Require package digests to match their manifest (signed paks)
require_signed = {}

[cache]
; Directory for cached chunk files and the residency snapshot
; If empty, defaults to the platform cache directory + /pakstream
directory = {}
; Maximum bytes of cached pak data kept on disk (default: 4GB)
; Supports: KB, MB, GB suffixes (e.g., 500MB, 4GB)
capacity = {}

[fetch]
; Maximum number of chunk fetches in flight at once (default: 4)
max_concurrent = {}
; Retries after a failed chunk fetch before giving up (default: 3)
retry_limit = {}
; Seconds a blocking read waits before returning a timeout (default: 30)
timeout_secs = {}
"#,
            self.streamer.server_host,
            self.streamer.mode,
            local_source_directory,
            require_signed,
            self.cache.directory.display(),
            format_size(self.cache.capacity_bytes),
            self.fetch.max_concurrent,
            self.fetch.retry_limit,
            self.fetch.timeout_secs,
        )
    }
}

/// Get the path to the config directory (`~/.config/pakstream`).
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pakstream")
}

/// Get the path to the config file (`~/.config/pakstream/config.ini`).
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

/// Get the default cache directory (platform cache dir + `/pakstream`).
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pakstream")
}

/// Parse an INI document into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the
/// INI. Unknown sections and keys are rejected so typos surface at load time.
fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    reject_unknown_keys(ini)?;

    let mut config = ConfigFile::default();

    if let Some(section) = ini.section(Some("streamer")) {
        if let Some(value) = section.get("server_host") {
            if value.trim().is_empty() {
                return Err(invalid_value(
                    "streamer",
                    "server_host",
                    value,
                    "expected host:port of the pak server",
                ));
            }
            config.streamer.server_host = value.trim().to_string();
        }

        if let Some(value) = section.get("mode") {
            config.streamer.mode = match value.trim().to_lowercase().as_str() {
                "remote" => SourceMode::Remote,
                "local" => SourceMode::Local,
                _ => {
                    return Err(invalid_value(
                        "streamer",
                        "mode",
                        value,
                        "expected 'remote' or 'local'",
                    ));
                }
            };
        }

        if let Some(value) = section.get("local_source_directory") {
            if !value.trim().is_empty() {
                config.streamer.local_source_directory = Some(expand_tilde(value.trim()));
            }
        }

        if let Some(value) = section.get("require_signed") {
            config.streamer.require_signed = parse_bool(value).ok_or_else(|| {
                invalid_value(
                    "streamer",
                    "require_signed",
                    value,
                    "expected a boolean (true/false, yes/no, on/off, 1/0)",
                )
            })?;
        }
    }

    if let Some(section) = ini.section(Some("cache")) {
        if let Some(value) = section.get("directory") {
            if !value.trim().is_empty() {
                config.cache.directory = expand_tilde(value.trim());
            }
        }

        if let Some(value) = section.get("capacity") {
            config.cache.capacity_bytes = parse_size(value).map_err(|_| {
                invalid_value(
                    "cache",
                    "capacity",
                    value,
                    "expected format like '2GB', '500MB', or '1024KB'",
                )
            })?;
        }
    }

    if let Some(section) = ini.section(Some("fetch")) {
        if let Some(value) = section.get("max_concurrent") {
            let parsed: usize = value.trim().parse().map_err(|_| {
                invalid_value("fetch", "max_concurrent", value, "expected a positive integer")
            })?;
            if parsed == 0 {
                return Err(invalid_value(
                    "fetch",
                    "max_concurrent",
                    value,
                    "expected a positive integer",
                ));
            }
            config.fetch.max_concurrent = parsed;
        }

        if let Some(value) = section.get("retry_limit") {
            config.fetch.retry_limit = value.trim().parse().map_err(|_| {
                invalid_value("fetch", "retry_limit", value, "expected a non-negative integer")
            })?;
        }

        if let Some(value) = section.get("timeout_secs") {
            let parsed: u64 = value.trim().parse().map_err(|_| {
                invalid_value(
                    "fetch",
                    "timeout_secs",
                    value,
                    "expected a positive number of seconds",
                )
            })?;
            if parsed == 0 {
                return Err(invalid_value(
                    "fetch",
                    "timeout_secs",
                    value,
                    "expected a positive number of seconds",
                ));
            }
            config.fetch.timeout_secs = parsed;
        }
    }

    Ok(config)
}

/// Fail on any section or key the config surface doesn't define.
fn reject_unknown_keys(ini: &Ini) -> Result<(), ConfigFileError> {
    for (section, properties) in ini.iter() {
        let Some(name) = section else {
            // Keys before any [section] header.
            if let Some((key, value)) = properties.iter().next() {
                return Err(invalid_value(
                    "",
                    key,
                    value,
                    "keys must appear under [streamer], [cache], or [fetch]",
                ));
            }
            continue;
        };

        let Some((_, known)) = KNOWN_KEYS.iter().find(|(s, _)| *s == name) else {
            let (key, value) = properties.iter().next().unwrap_or(("", ""));
            return Err(invalid_value(
                name,
                key,
                value,
                "unknown section; expected [streamer], [cache], or [fetch]",
            ));
        };

        for (key, value) in properties.iter() {
            if !known.contains(&key) {
                return Err(invalid_value(
                    name,
                    key,
                    value,
                    format!("unknown key; expected one of: {}", known.join(", ")),
                ));
            }
        }
    }
    Ok(())
}

fn invalid_value(
    section: impl Into<String>,
    key: impl Into<String>,
    value: impl Into<String>,
    reason: impl Into<String>,
) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.into(),
        key: key.into(),
        value: value.into(),
        reason: reason.into(),
    }
}

/// Parse a boolean config value.
///
/// Accepts true/false, yes/no, on/off, and 1/0, case-insensitive. Anything
/// else is `None` so the caller can report the exact key and value.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '2GB', '500MB', or '1024KB'")]
pub struct SizeParseError {
    input: String,
}

impl SizeParseError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Parse a human-readable size string into bytes.
///
/// Supports:
/// - Bare numbers (treated as bytes)
/// - KB/K suffix (1024 bytes)
/// - MB/M suffix (1024² bytes)
/// - GB/G suffix (1024³ bytes)
/// - Case-insensitive
/// - Whitespace tolerant
///
/// # Examples
///
/// ```
/// use pakstream::config::parse_size;
///
/// assert_eq!(parse_size("1024").unwrap(), 1024);
/// assert_eq!(parse_size("1KB").unwrap(), 1024);
/// assert_eq!(parse_size("1 KB").unwrap(), 1024);
/// assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
/// assert_eq!(parse_size("500mb").unwrap(), 500 * 1024 * 1024);
/// ```
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SizeParseError::new(s));
    }

    let upper = s.to_uppercase();
    let (num_str, multiplier) = if upper.ends_with("GB") || upper.ends_with('G') {
        let suffix_len = if upper.ends_with("GB") { 2 } else { 1 };
        (s[..s.len() - suffix_len].trim(), 1024_u64 * 1024 * 1024)
    } else if upper.ends_with("MB") || upper.ends_with('M') {
        let suffix_len = if upper.ends_with("MB") { 2 } else { 1 };
        (s[..s.len() - suffix_len].trim(), 1024_u64 * 1024)
    } else if upper.ends_with("KB") || upper.ends_with('K') {
        let suffix_len = if upper.ends_with("KB") { 2 } else { 1 };
        (s[..s.len() - suffix_len].trim(), 1024_u64)
    } else {
        (s, 1_u64)
    };

    let num: u64 = num_str.parse().map_err(|_| SizeParseError::new(s))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SizeParseError::new(s))
}

/// Format a byte count as a human-readable string.
///
/// # Examples
///
/// ```
/// use pakstream::config::format_size;
///
/// assert_eq!(format_size(1024), "1KB");
/// assert_eq!(format_size(4 * 1024 * 1024 * 1024), "4GB");
/// assert_eq!(format_size(500 * 1024 * 1024), "500MB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    if bytes >= GB && bytes.is_multiple_of(GB) {
        format!("{}GB", bytes / GB)
    } else if bytes >= MB && bytes.is_multiple_of(MB) {
        format!("{}MB", bytes / MB)
    } else if bytes >= KB && bytes.is_multiple_of(KB) {
        format!("{}KB", bytes / KB)
    } else {
        format!("{}", bytes)
    }
}
