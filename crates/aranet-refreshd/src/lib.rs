//! Daemon that keeps paired Aranet4 sensors refreshed over BLE.
//!
//! One refresh engine runs per configured sensor. Readings, availability
//! changes and device-info updates are written to the terminal as log lines
//! or JSON lines.
//!
//! # Configuration
//!
//! The daemon reads `~/.config/aranet-refresh/config.toml` (the platform
//! config directory elsewhere):
//!
//! ```toml
//! [refresh]
//! backoff_step_secs = 5
//! backoff_ceiling_secs = 300
//! unavailable_grace_secs = 60
//!
//! [ble]
//! connect_timeout_secs = 15
//!
//! [output]
//! format = "json"
//!
//! [[devices]]
//! identifier = "AA:BB:CC:DD:EE:FF"
//! alias = "office"
//! ```

pub mod config;
pub mod sink;

pub use config::{
    BleSection, Config, ConfigError, DeviceConfig, OutputFormat, OutputSection, RefreshSection,
    ValidationError, default_config_path,
};
pub use sink::EventSink;
