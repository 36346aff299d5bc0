//! Node configuration types.

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use slb_availability::Descriptor;
use slb_engine::StreamDefaults;
use thiserror::Error;

use crate::logging::LoggingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Name prefix of the classifier-facing interfaces
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: String,
    #[serde(default = "default_identifier_offset_base")]
    pub identifier_offset_base: u32,
    #[serde(default = "default_pending_retry_interval_secs")]
    pub pending_retry_interval_secs: u64,
    #[serde(default = "default_pending_debounce_ms")]
    pub pending_debounce_ms: u64,
    #[serde(default = "default_watch_retry_delay_ms")]
    pub watch_retry_delay_ms: u64,
    #[serde(default)]
    pub availability: AvailabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailabilityConfig {
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Announced to watchers while the node forwards.
    #[serde(default = "default_descriptor")]
    pub descriptor: BTreeMap<String, String>,
}

fn default_interface_prefix() -> String {
    slb_engine::DEFAULT_INTERFACE_PREFIX.to_string()
}

fn default_identifier_offset_base() -> u32 {
    5000
}

fn default_pending_retry_interval_secs() -> u64 {
    10
}

fn default_pending_debounce_ms() -> u64 {
    100
}

fn default_watch_retry_delay_ms() -> u64 {
    1000
}

fn default_stop_timeout_secs() -> u64 {
    2
}

fn default_descriptor() -> BTreeMap<String, String> {
    BTreeMap::from([("name".to_string(), "stateless-lb".to_string())])
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
            descriptor: default_descriptor(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            interface_prefix: default_interface_prefix(),
            identifier_offset_base: default_identifier_offset_base(),
            pending_retry_interval_secs: default_pending_retry_interval_secs(),
            pending_debounce_ms: default_pending_debounce_ms(),
            watch_retry_delay_ms: default_watch_retry_delay_ms(),
            availability: AvailabilityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_yaml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.interface_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "interface_prefix must not be empty".to_string(),
            ));
        }
        if self.pending_retry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "pending_retry_interval_secs must be positive".to_string(),
            ));
        }
        if self.pending_debounce() >= self.pending_retry_interval() {
            return Err(ConfigError::Invalid(format!(
                "pending_debounce_ms ({}) must be shorter than the pending retry interval ({}s)",
                self.pending_debounce_ms, self.pending_retry_interval_secs
            )));
        }
        if self.availability.stop_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "availability.stop_timeout_secs must be positive".to_string(),
            ));
        }
        if self.availability.descriptor.is_empty() {
            return Err(ConfigError::Invalid(
                "availability.descriptor must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_secs(self.pending_retry_interval_secs)
    }

    pub fn pending_debounce(&self) -> Duration {
        Duration::from_millis(self.pending_debounce_ms)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.availability.stop_timeout_secs)
    }

    pub fn stream_defaults(&self) -> StreamDefaults {
        StreamDefaults {
            interface_prefix: self.interface_prefix.clone(),
            pending_retry_interval: self.pending_retry_interval(),
            pending_debounce: self.pending_debounce(),
            watch_retry_delay: self.watch_retry_delay(),
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::available(self.availability.descriptor.clone())
    }
}
