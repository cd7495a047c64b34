//! Daemon configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aranet_refresh::transport::normalize_identifier;
use aranet_refresh::{ConnectionConfig, RefreshConfig};
use serde::{Deserialize, Serialize};

/// Daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Refresh timing.
    pub refresh: RefreshSection,
    /// BLE operation timeouts.
    pub ble: BleSection,
    /// Event output.
    pub output: OutputSection,
    /// Paired sensors.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file yields the default configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use aranet_refreshd::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.refresh.validate());
        errors.extend(self.ble.validate());

        let mut seen = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            let key = normalize_identifier(&device.identifier);
            if !key.is_empty() && !seen.insert(key) {
                errors.push(ValidationError {
                    field: format!("{}.identifier", prefix),
                    message: format!("duplicate device identifier '{}'", device.identifier),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Check a seconds value against inclusive bounds.
fn check_secs(
    errors: &mut Vec<ValidationError>,
    field: &str,
    value: u64,
    min: u64,
    max: u64,
) {
    if value < min || value > max {
        errors.push(ValidationError {
            field: field.to_string(),
            message: format!("{} seconds is out of range ({}..={})", value, min, max),
        });
    }
}

/// `[refresh]`: overrides for the engine's timing, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    /// Backoff increment per consecutive failure.
    pub backoff_step_secs: u64,
    /// Largest backoff delay.
    pub backoff_ceiling_secs: u64,
    /// How long past the expected refresh before reporting unavailable.
    pub unavailable_grace_secs: u64,
    /// Added to the sensor's own time-to-next-measurement.
    pub refresh_slack_secs: u64,
    /// Smallest delay after a successful read.
    pub min_refresh_delay_secs: u64,
    /// How long identity strings stay cached.
    pub metadata_ttl_secs: u64,
    /// Direct lookup timeout.
    pub find_timeout_secs: u64,
    /// Fallback scan duration.
    pub scan_duration_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self::from(&RefreshConfig::default())
    }
}

impl From<&RefreshConfig> for RefreshSection {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            backoff_step_secs: config.backoff_step.as_secs(),
            backoff_ceiling_secs: config.backoff_ceiling.as_secs(),
            unavailable_grace_secs: config.unavailable_grace.as_secs(),
            refresh_slack_secs: config.refresh_slack.as_secs(),
            min_refresh_delay_secs: config.min_refresh_delay.as_secs(),
            metadata_ttl_secs: config.metadata_ttl.as_secs(),
            find_timeout_secs: config.find_timeout.as_secs(),
            scan_duration_secs: config.scan_duration.as_secs(),
        }
    }
}

impl RefreshSection {
    /// Build the engine configuration.
    pub fn to_refresh_config(&self) -> RefreshConfig {
        RefreshConfig::default()
            .backoff_step(Duration::from_secs(self.backoff_step_secs))
            .backoff_ceiling(Duration::from_secs(self.backoff_ceiling_secs))
            .unavailable_grace(Duration::from_secs(self.unavailable_grace_secs))
            .refresh_slack(Duration::from_secs(self.refresh_slack_secs))
            .min_refresh_delay(Duration::from_secs(self.min_refresh_delay_secs))
            .metadata_ttl(Duration::from_secs(self.metadata_ttl_secs))
            .find_timeout(Duration::from_secs(self.find_timeout_secs))
            .scan_duration(Duration::from_secs(self.scan_duration_secs))
    }

    /// Validate refresh timing.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        check_secs(&mut errors, "refresh.backoff_step_secs", self.backoff_step_secs, 1, 600);
        check_secs(
            &mut errors,
            "refresh.backoff_ceiling_secs",
            self.backoff_ceiling_secs,
            1,
            3600,
        );
        check_secs(
            &mut errors,
            "refresh.unavailable_grace_secs",
            self.unavailable_grace_secs,
            0,
            86_400,
        );
        check_secs(&mut errors, "refresh.refresh_slack_secs", self.refresh_slack_secs, 0, 600);
        check_secs(
            &mut errors,
            "refresh.min_refresh_delay_secs",
            self.min_refresh_delay_secs,
            1,
            600,
        );
        check_secs(
            &mut errors,
            "refresh.metadata_ttl_secs",
            self.metadata_ttl_secs,
            0,
            7 * 86_400,
        );
        check_secs(&mut errors, "refresh.find_timeout_secs", self.find_timeout_secs, 1, 120);
        check_secs(&mut errors, "refresh.scan_duration_secs", self.scan_duration_secs, 1, 120);

        if self.backoff_ceiling_secs < self.backoff_step_secs {
            errors.push(ValidationError {
                field: "refresh.backoff_ceiling_secs".to_string(),
                message: format!(
                    "ceiling {} is below the backoff step {}",
                    self.backoff_ceiling_secs, self.backoff_step_secs
                ),
            });
        }

        errors
    }
}

/// `[ble]`: per-operation timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSection {
    /// Connection timeout.
    pub connect_timeout_secs: u64,
    /// Service discovery timeout.
    pub discovery_timeout_secs: u64,
    /// Characteristic read timeout.
    pub read_timeout_secs: u64,
    /// Disconnect timeout.
    pub disconnect_timeout_secs: u64,
}

impl Default for BleSection {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            connect_timeout_secs: defaults.connection_timeout.as_secs(),
            discovery_timeout_secs: defaults.discovery_timeout.as_secs(),
            read_timeout_secs: defaults.read_timeout.as_secs(),
            disconnect_timeout_secs: defaults.disconnect_timeout.as_secs(),
        }
    }
}

impl BleSection {
    /// Build the btleplug transport timeouts.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .connection_timeout(Duration::from_secs(self.connect_timeout_secs))
            .discovery_timeout(Duration::from_secs(self.discovery_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .disconnect_timeout(Duration::from_secs(self.disconnect_timeout_secs))
    }

    /// Validate BLE timeouts.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check_secs(&mut errors, "ble.connect_timeout_secs", self.connect_timeout_secs, 1, 120);
        check_secs(
            &mut errors,
            "ble.discovery_timeout_secs",
            self.discovery_timeout_secs,
            1,
            120,
        );
        check_secs(&mut errors, "ble.read_timeout_secs", self.read_timeout_secs, 1, 120);
        check_secs(
            &mut errors,
            "ble.disconnect_timeout_secs",
            self.disconnect_timeout_secs,
            1,
            120,
        );
        errors
    }
}

/// How events are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable log lines.
    #[default]
    Log,
    /// One JSON object per event on stdout.
    Json,
}

/// `[output]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    /// Event output format.
    pub format: OutputFormat,
}

/// A paired sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Peripheral identifier: the BLE address, or the platform UUID on macOS.
    pub identifier: String,
    /// Friendly name used in output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl DeviceConfig {
    /// A device without an alias.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            alias: None,
        }
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.identifier.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.identifier", prefix),
                message: "device identifier cannot be empty".to_string(),
            });
        }

        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{}.alias", prefix),
                message: "alias cannot be empty string (omit it instead)".to_string(),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `refresh.backoff_step_secs` or `devices[0].identifier`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aranet-refresh")
        .join("config.toml")
}
