//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/courier/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/courier/` (~/.config/courier/)
//! - Data: `$XDG_DATA_HOME/courier/` (~/.local/share/courier/) - batch files and key/value store
//! - State/Logs: `$XDG_STATE_HOME/courier/` (~/.local/state/courier/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default collection endpoint host (batch uploads go to `https://<host>/b`)
pub const DEFAULT_API_HOST: &str = "api.courier.dev/v1";

/// Default settings CDN host
pub const DEFAULT_CDN_HOST: &str = "cdn.courier.dev/v1";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Source write key; identifies the batch queue and is sent in every envelope
    #[serde(default)]
    pub write_key: String,

    /// Collection endpoint host
    #[serde(default = "default_api_host")]
    pub api_host: String,

    /// Settings CDN host
    #[serde(default = "default_cdn_host")]
    pub cdn_host: String,

    /// Number of events that triggers a flush
    #[serde(default = "default_flush_at")]
    pub flush_at: usize,

    /// Seconds between periodic flushes (0 disables the timer)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Override for the storage directory (defaults to the XDG data dir)
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Register the first-party collector destination automatically
    #[serde(default = "default_true")]
    pub auto_add_collector: bool,

    /// Fetch remote settings on startup
    #[serde(default = "default_true")]
    pub fetch_settings: bool,

    /// HTTP client configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_key: String::new(),
            api_host: default_api_host(),
            cdn_host: default_cdn_host(),
            flush_at: default_flush_at(),
            flush_interval_secs: default_flush_interval(),
            storage_dir: None,
            auto_add_collector: true,
            fetch_settings: true,
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_api_host() -> String {
    DEFAULT_API_HOST.to_string()
}

fn default_cdn_host() -> String {
    DEFAULT_CDN_HOST.to_string()
}

fn default_flush_at() -> usize {
    20
}

fn default_flush_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// HTTP client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    20
}

fn default_connect_timeout() -> u64 {
    15
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate configuration for building a client
    pub fn validate(&self) -> Result<()> {
        if self.write_key.trim().is_empty() {
            return Err(Error::Config("write_key is required".to_string()));
        }
        if self.api_host.trim().is_empty() {
            return Err(Error::Config("api_host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Directory holding batch files and the key/value store for this write key
    pub fn resolved_storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join(&self.write_key))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/courier/config.toml` (~/.config/courier/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("courier").join("config.toml")
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/courier/` (~/.local/share/courier/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("courier")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/courier/` (~/.local/state/courier/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("courier")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("courier.log")
    }
}
