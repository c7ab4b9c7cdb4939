//! Application settings

use crate::core::coordinator::CoordinatorOptions;
use crate::core::identity::IdentityTable;
use crate::core::locator::default_port_patterns;
use crate::core::protocol::DEFAULT_MIN_DATA_FIELDS;
use crate::core::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The platform has no config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("Config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`AppConfig`]
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serializing the config failed
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial link settings
    pub serial: SerialSettings,
    /// Streaming and persistence settings
    pub acquisition: AcquisitionSettings,
    /// Output location
    pub data: DataSettings,
    /// Completion notice settings
    pub notify: NotifySettings,
    /// Hardware ID → logical ID
    pub identities: IdentityTable,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound on a single read (ms)
    pub read_timeout_ms: u64,
    /// Upper bound on the boot handshake (ms)
    pub handshake_timeout_ms: u64,
    /// DTR low time of a reset pulse (ms)
    pub reset_settle_ms: u64,
    /// Descriptor substrings of candidate ports
    pub port_patterns: Vec<String>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout_ms: 1000,
            handshake_timeout_ms: 15_000,
            reset_settle_ms: 100,
            port_patterns: default_port_patterns(),
        }
    }
}

/// Streaming and persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Flush period while streaming (s)
    pub save_period_secs: u64,
    /// Flush as soon as this many rows are buffered
    pub max_buffered_rows: usize,
    /// Narrower lines are discarded as chatter
    pub min_data_fields: usize,
    /// Completion monitor poll period (ms)
    pub monitor_interval_ms: u64,
    /// Reboot the board when a run is cancelled
    pub reset_on_cancel: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            save_period_secs: 180,
            max_buffered_rows: 500,
            min_data_fields: DEFAULT_MIN_DATA_FIELDS,
            monitor_interval_ms: 100,
            reset_on_cancel: true,
        }
    }
}

/// Output location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Directory for measurement files; the platform data dir if unset
    pub base_dir: Option<PathBuf>,
    /// Trial label added to file names
    pub trial_name: Option<String>,
}

/// Completion notice settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Who receives the notice
    pub recipient: String,
}

impl AppConfig {
    /// Load from `path`, falling back to defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `config.toml` from the platform config directory
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load(&path)
    }

    /// Write pretty TOML to `path`
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check values that would make acquisition impossible
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identities.is_empty() {
            return Err(ConfigError::Invalid("identity table is empty".into()));
        }
        if let Some((logical_id, hardware_ids)) = self.identities.duplicate_logical_ids().into_iter().next() {
            return Err(ConfigError::Invalid(format!(
                "logical ID {} is mapped to {}",
                logical_id,
                hardware_ids.join(", ")
            )));
        }
        let zero = [
            ("serial.read_timeout_ms", self.serial.read_timeout_ms),
            ("serial.handshake_timeout_ms", self.serial.handshake_timeout_ms),
            ("acquisition.save_period_secs", self.acquisition.save_period_secs),
            ("acquisition.monitor_interval_ms", self.acquisition.monitor_interval_ms),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.acquisition.max_buffered_rows == 0 {
            return Err(ConfigError::Invalid("acquisition.max_buffered_rows must be greater than zero".into()));
        }
        Ok(())
    }

    /// Output directory, preferring the configured one
    pub fn data_dir(&self) -> PathBuf {
        self.data
            .base_dir
            .clone()
            .or_else(super::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Options for the session layer
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            baud_rate: self.serial.baud_rate,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            reset_settle: Duration::from_millis(self.serial.reset_settle_ms),
            save_period: Duration::from_secs(self.acquisition.save_period_secs),
            max_buffered_rows: self.acquisition.max_buffered_rows,
            min_data_fields: self.acquisition.min_data_fields,
            reset_on_cancel: self.acquisition.reset_on_cancel,
            data_dir: self.data_dir(),
            trial_name: self.data.trial_name.clone(),
        }
    }

    /// Options for the coordinator
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            session: self.session_options(),
            identities: self.identities.clone(),
            port_patterns: self.serial.port_patterns.clone(),
            handshake_timeout: Duration::from_millis(self.serial.handshake_timeout_ms),
            monitor_interval: Duration::from_millis(self.acquisition.monitor_interval_ms),
            recipient: self.notify.recipient.clone(),
        }
    }
}
