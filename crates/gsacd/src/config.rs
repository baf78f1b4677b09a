//! Configuration file parsing and structures.
//!
//! gsacd reads one TOML file: logging, the broker connection, the optional
//! HTTP API, and one `[devices.<entry_id>]` record per air conditioner.
//! Device records are versioned; older records are migrated in memory when
//! the file is loaded.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;

use crate::integrations::gsac::DeviceId;
use crate::integrations::gsac::DeviceIdError;
use crate::integrations::gsac::Topics;
pub use crate::integrations::mqtt::MqttConfig;

/// Version written by the setup flow
pub const DEVICE_RECORD_VERSION: u32 = 2;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    pub mqtt: MqttConfig,

    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Key = entry id
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_api_port(),
        }
    }
}

fn default_record_version() -> u32 {
    1
}

/// One persisted air conditioner, as written in the config file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceEntry {
    /// Kept raw so that old records with a bad identifier still load
    pub device_id: String,

    #[serde(default = "default_record_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Topics derived when the record was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Topics>,
}

/// A device record that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub entry_id: String,
    pub device_id: DeviceId,
    pub name: String,
}

impl DeviceEntry {
    /// Bring the record up to [`DEVICE_RECORD_VERSION`]
    pub fn migrate(&mut self, entry_id: &str) -> Result<(), ConfigError> {
        match self.version {
            1 => {
                if let Err(e) = DeviceId::parse(&self.device_id) {
                    warn!(
                        "Device {}: invalid device id {:?} in version 1 record: {}",
                        entry_id, self.device_id, e
                    );
                }
                self.version = DEVICE_RECORD_VERSION;
                info!("Device {}: record migrated to version {}", entry_id, self.version);
                Ok(())
            }
            DEVICE_RECORD_VERSION => Ok(()),
            version => Err(ConfigError::UnsupportedVersion {
                entry: entry_id.to_string(),
                version,
            }),
        }
    }

    /// Validate the identifier and settle the display name
    pub fn resolve(&self, entry_id: &str) -> Result<Device, ConfigError> {
        let device_id =
            DeviceId::parse(&self.device_id).map_err(|source| ConfigError::InvalidDevice {
                entry: entry_id.to_string(),
                source,
            })?;

        if let Some(stored) = &self.topics {
            let changed = stored.diff(&Topics::for_device(&device_id));
            if !changed.is_empty() {
                let keys: Vec<&str> = changed.iter().map(|k| k.name()).collect();
                warn!(
                    "Device {}: stored topics differ from derived ones ({}), using derived",
                    entry_id,
                    keys.join(", ")
                );
            }
        }

        Ok(Device {
            entry_id: entry_id.to_string(),
            name: self
                .name
                .clone()
                .unwrap_or_else(|| format!("GSAC {}", device_id)),
            device_id,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file and migrate device records
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        for (entry_id, entry) in config.devices.iter_mut() {
            entry.migrate(entry_id)?;
        }
        Ok(config)
    }

    /// Every configured device, validated.
    ///
    /// A record with a bad identifier is reported and skipped so the other
    /// devices still come up. Two records for the same unit are an error.
    pub fn devices(&self) -> Result<(Vec<Device>, Vec<ConfigError>), ConfigError> {
        let mut devices: Vec<Device> = Vec::new();
        let mut skipped = Vec::new();

        for (entry_id, entry) in &self.devices {
            let device = match entry.resolve(entry_id) {
                Ok(device) => device,
                Err(e) => {
                    skipped.push(e);
                    continue;
                }
            };

            if let Some(other) = devices
                .iter()
                .find(|d| d.device_id.same_device(&device.device_id))
            {
                return Err(ConfigError::DuplicateDevice {
                    device_id: device.device_id.to_string(),
                    first: other.entry_id.clone(),
                    second: entry_id.clone(),
                });
            }
            devices.push(device);
        }

        Ok((devices, skipped))
    }

    /// Identifiers already in use, for the setup flow
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter_map(|entry| DeviceId::parse(&entry.device_id).ok())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Device {entry}: unsupported record version {version}")]
    UnsupportedVersion { entry: String, version: u32 },

    #[error("Device {entry}: {source}")]
    InvalidDevice {
        entry: String,
        #[source]
        source: DeviceIdError,
    },

    #[error("Device {device_id} is configured twice ({first}, {second})")]
    DuplicateDevice {
        device_id: String,
        first: String,
        second: String,
    },
}
