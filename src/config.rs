//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::channel::DEFAULT_DEVICE_PATH;
use crate::client::{DEFAULT_CONTAINER, DEFAULT_SIZE_GB};
use crate::env::substitute_env_vars;
use crate::error::DyskError;
use crate::store::azure::DEFAULT_DOMAIN;

/// Configuration file read when no path is given and it exists
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dysk/config.yaml";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: RawStorageConfig,

    #[serde(default)]
    pub device: RawDeviceConfig,

    #[serde(default)]
    pub defaults: RawDefaults,
}

/// Storage account section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStorageConfig {
    pub account: Option<String>,

    pub key: Option<String>,

    /// Storage DNS suffix, e.g. `blob.core.windows.net`
    pub domain: Option<String>,

    /// Timeout of each blob service request
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
}

/// Control channel section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDeviceConfig {
    pub path: Option<PathBuf>,
}

/// Defaults for mount and create
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDefaults {
    pub container: Option<String>,
    pub size_gb: Option<u64>,
    pub vhd: Option<bool>,
}

// =============================================================================
// Resolved Config
// =============================================================================

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub device: DeviceConfig,
    pub defaults: Defaults,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Clone)]
pub struct StorageConfig {
    pub account: Option<String>,
    pub key: Option<String>,
    pub domain: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("account", &self.account)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("domain", &self.domain)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Control channel endpoint
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Defaults {
    pub container: String,
    pub size_gb: u64,
    pub vhd: bool,
}

// =============================================================================
// Resolution Logic
// =============================================================================

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RawConfig {
    /// Resolve raw config into final config by filling in defaults
    pub fn resolve(self) -> Result<Config, ConfigError> {
        Ok(self.with_defaults())
    }

    fn with_defaults(self) -> Config {
        let RawConfig {
            logging,
            storage,
            device,
            defaults,
        } = self;

        Config {
            logging,
            storage: StorageConfig {
                account: non_empty(storage.account),
                key: non_empty(storage.key),
                domain: non_empty(storage.domain).unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
                request_timeout: storage.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            },
            device: DeviceConfig {
                path: device
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_PATH)),
            },
            defaults: Defaults {
                container: defaults
                    .container
                    .unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
                size_gb: defaults.size_gb.unwrap_or(DEFAULT_SIZE_GB),
                vhd: defaults.vhd.unwrap_or(true),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default().with_defaults()
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references first
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        if content.trim().is_empty() {
            return RawConfig::default().resolve();
        }
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Load `path`, or the default file when it exists, or built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.size_gb == 0 {
            return Err(ConfigError::ValidationError(
                "defaults.size_gb must be at least 1".to_string(),
            ));
        }
        if self.defaults.container.is_empty() {
            return Err(ConfigError::ValidationError(
                "defaults.container cannot be empty".to_string(),
            ));
        }
        if self.device.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "device.path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for DyskError {
    fn from(err: ConfigError) -> Self {
        DyskError::Config(err.to_string())
    }
}
