use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, HttpConfig, DEFAULT_API_HOST, DEFAULT_CDN_HOST};
use crate::error::{Error, Result};
use crate::pipeline::{default_policies, BatchUploader, FlushPolicy, DEFAULT_FLUSH_AT};
use crate::retry::TimeProvider;
use crate::settings::Settings;
use crate::storage::StorageProvider;

/// Runtime options for an [`Analytics`](super::Analytics) client.
///
/// Usually derived from the on-disk [`Config`]; the injectable fields
/// (`flush_policies`, `uploader`, `time_provider`) only exist here.
#[derive(Clone)]
pub struct Configuration {
    pub write_key: String,
    pub api_host: String,
    pub cdn_host: String,
    pub flush_at: usize,
    pub flush_interval: Duration,
    /// Replaces the count + interval defaults when non-empty
    pub flush_policies: Vec<Arc<dyn FlushPolicy>>,
    pub storage_provider: StorageProvider,
    pub auto_add_collector: bool,
    pub fetch_settings: bool,
    /// Used when nothing is cached yet
    pub default_settings: Option<Settings>,
    pub http: HttpConfig,
    /// Replaces the HTTP uploader
    pub uploader: Option<Arc<dyn BatchUploader>>,
    pub time_provider: Option<Arc<dyn TimeProvider>>,
}

impl Configuration {
    pub fn new(write_key: impl Into<String>) -> Self {
        let write_key = write_key.into();
        Self {
            storage_provider: StorageProvider::File(Config::data_dir().join(&write_key)),
            write_key,
            api_host: DEFAULT_API_HOST.to_string(),
            cdn_host: DEFAULT_CDN_HOST.to_string(),
            flush_at: DEFAULT_FLUSH_AT,
            flush_interval: Duration::from_secs(30),
            flush_policies: Vec::new(),
            auto_add_collector: true,
            fetch_settings: true,
            default_settings: None,
            http: HttpConfig::default(),
            uploader: None,
            time_provider: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            write_key: config.write_key.clone(),
            api_host: config.api_host.clone(),
            cdn_host: config.cdn_host.clone(),
            flush_at: config.flush_at,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            flush_policies: Vec::new(),
            storage_provider: StorageProvider::File(config.resolved_storage_dir()),
            auto_add_collector: config.auto_add_collector,
            fetch_settings: config.fetch_settings,
            default_settings: None,
            http: config.http.clone(),
            uploader: None,
            time_provider: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_key.trim().is_empty() {
            return Err(Error::Config("write_key is required".to_string()));
        }
        if self.api_host.trim().is_empty() {
            return Err(Error::Config("api_host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Configured policies, or a count policy plus an interval timer.
    pub fn policies(&self) -> Vec<Arc<dyn FlushPolicy>> {
        if self.flush_policies.is_empty() {
            default_policies(self.flush_at, self.flush_interval)
        } else {
            self.flush_policies.clone()
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("write_key", &self.write_key)
            .field("api_host", &self.api_host)
            .field("cdn_host", &self.cdn_host)
            .field("flush_at", &self.flush_at)
            .field("flush_interval", &self.flush_interval)
            .field("flush_policies", &self.flush_policies.len())
            .field("storage_provider", &self.storage_provider)
            .field("auto_add_collector", &self.auto_add_collector)
            .field("fetch_settings", &self.fetch_settings)
            .finish_non_exhaustive()
    }
}
