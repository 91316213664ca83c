//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beamline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beamline/` (~/.config/beamline/)
//! - Data (queue): `$XDG_DATA_HOME/beamline/` (~/.local/share/beamline/)
//! - State/Logs: `$XDG_STATE_HOME/beamline/` (~/.local/state/beamline/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

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
#[derive(Debug, Deserialize, Default, Clone)]
pub struct TrackerConfig {
    /// Collection endpoint configuration
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Delivery worker tuning
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Durable queue storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Production collection host
    #[serde(default = "default_production_host")]
    pub production_host: String,

    /// Debug/test collection host, used when the tracker is initialized
    /// with the debug flag set
    #[serde(default = "default_debug_host")]
    pub debug_host: String,

    /// Use https for endpoint URLs
    #[serde(default = "default_https")]
    pub https: bool,

    /// HTTP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// HTTP read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            production_host: default_production_host(),
            debug_host: default_debug_host(),
            https: default_https(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl EndpointConfig {
    /// The host events are delivered to, honoring the debug flag.
    pub fn host(&self, debug: bool) -> &str {
        if debug {
            &self.debug_host
        } else {
            &self.production_host
        }
    }

    /// URL scheme for endpoint URLs.
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    /// Event collection URL (without the query string).
    pub fn event_url(&self, debug: bool) -> String {
        format!("{}://{}/event", self.scheme(), self.host(debug))
    }

    /// Channel content URL (without the query string).
    pub fn channel_url(&self) -> String {
        format!("{}://{}/channel", self.scheme(), &self.production_host)
    }
}

fn default_production_host() -> String {
    "api.beamline.dev".to_string()
}

fn default_debug_host() -> String {
    "api-test.beamline.dev".to_string()
}

fn default_https() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    30
}

/// Delivery worker tuning
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Seconds to wait between reachability checks while the network is down
    #[serde(default = "default_connectivity_retry")]
    pub connectivity_retry_secs: u64,

    /// First retry backoff in seconds; doubles on every consecutive failure
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Minimum milliseconds between consecutive deliveries.
    ///
    /// The server stores event timestamps at one second precision; spacing
    /// sends out guarantees consecutive events sort stably by timestamp.
    #[serde(default = "default_min_event_interval")]
    pub min_event_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            connectivity_retry_secs: default_connectivity_retry(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            min_event_interval_ms: default_min_event_interval(),
        }
    }
}

impl DeliveryConfig {
    pub fn connectivity_retry(&self) -> Duration {
        Duration::from_secs(self.connectivity_retry_secs)
    }

    pub fn min_event_interval(&self) -> Duration {
        Duration::from_millis(self.min_event_interval_ms)
    }
}

fn default_connectivity_retry() -> u64 {
    16
}

fn default_base_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    64
}

fn default_min_event_interval() -> u64 {
    1000
}

/// What to do with a queued record that no longer deserializes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Drop the unreadable entry, log a warning, and keep the queue flowing
    Skip,
    /// Surface the deserialization error to the consumer
    Fail,
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        CorruptionPolicy::Skip
    }
}

/// Durable queue storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Namespace for the queue; also the on-disk table name
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Override path for the queue database file
    pub path: Option<PathBuf>,

    /// Policy for entries that fail to deserialize on restart
    #[serde(default)]
    pub corruption_policy: CorruptionPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            path: None,
            corruption_policy: CorruptionPolicy::default(),
        }
    }
}

fn default_namespace() -> String {
    "events".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TrackerConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(TrackerConfig::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: TrackerConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning an error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.production_host.is_empty() {
            return Err(Error::Config(
                "endpoint.production_host must not be empty".to_string(),
            ));
        }
        if self.endpoint.debug_host.is_empty() {
            return Err(Error::Config(
                "endpoint.debug_host must not be empty".to_string(),
            ));
        }
        if self.delivery.base_backoff_secs == 0 {
            return Err(Error::Config(
                "delivery.base_backoff_secs must be at least 1".to_string(),
            ));
        }
        if self.delivery.max_backoff_secs < self.delivery.base_backoff_secs {
            return Err(Error::Config(
                "delivery.max_backoff_secs must be >= delivery.base_backoff_secs".to_string(),
            ));
        }
        // The namespace doubles as a SQL table name
        let valid_namespace = !self.storage.namespace.is_empty()
            && !self.storage.namespace.starts_with(|c: char| c.is_ascii_digit())
            && self
                .storage
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_namespace {
            return Err(Error::Config(
                "storage.namespace must be alphanumeric/underscore and not start with a digit"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beamline/config.toml` (~/.config/beamline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beamline").join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    ///
    /// `$XDG_DATA_HOME/beamline/` (~/.local/share/beamline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beamline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beamline/` (~/.local/state/beamline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beamline")
    }

    /// Returns the queue database file path, honoring `storage.path`
    pub fn queue_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("queue.db"))
    }
}
