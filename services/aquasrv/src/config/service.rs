//! Service configuration loaded with figment
//!
//! Priority (lowest to highest): defaults, `aquasrv.yaml` (or `--config`),
//! `AQUASRV_*` environment variables with `__` as the nesting separator.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::framing::UartSpeed;
use crate::error::{AquaSrvError, Result};

/// Environment prefix
pub const ENV_PREFIX: &str = "AQUASRV_";
/// Default configuration file
pub const DEFAULT_CONFIG_FILE: &str = "aquasrv.yaml";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceInfo,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub can: CanConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service identity and switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Enables the debug-only console verbs
    #[serde(default)]
    pub debug: bool,

    /// Drive the in-process simulated board
    #[serde(default = "default_true")]
    pub simulate: bool,
}

/// Persistent storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Device configuration flash page image
    #[serde(default = "default_flash_path")]
    pub flash_path: String,

    /// FRAM image
    #[serde(default = "default_fram_path")]
    pub fram_path: String,
}

/// Serial links; an absent port disables the link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// RS-485 port of the MODBUS slave (speed comes from the device configuration)
    #[serde(default)]
    pub modbus_port: Option<String>,

    /// UART of the radio module
    #[serde(default)]
    pub zigbee_port: Option<String>,

    #[serde(default = "default_zigbee_baud")]
    pub zigbee_baud: u32,

    /// Serve the command console
    #[serde(default = "default_true")]
    pub console: bool,

    /// Console port; standard input/output when absent
    #[serde(default)]
    pub console_port: Option<String>,
}

/// CAN backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanBackend {
    #[default]
    Disabled,
    /// In-process bus, frames visible in the logs
    Simulated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanConfig {
    #[serde(default)]
    pub backend: CanBackend,
}

/// Logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log root; `AQUA_LOG_DIR` wins when set
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_true")]
    pub file: bool,

    #[serde(default)]
    pub json: bool,
}

fn default_service_name() -> String {
    "aquasrv".to_string()
}

fn default_true() -> bool {
    true
}

fn default_flash_path() -> String {
    "data/flash.bin".to_string()
}

fn default_fram_path() -> String {
    "data/fram.bin".to_string()
}

fn default_zigbee_baud() -> u32 {
    115_200
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            debug: false,
            simulate: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flash_path: default_flash_path(),
            fram_path: default_fram_path(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            modbus_port: None,
            zigbee_port: None,
            zigbee_baud: default_zigbee_baud(),
            console: true,
            console_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            file: true,
            json: false,
        }
    }
}

impl ServiceConfig {
    /// Load through the layered providers and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let config: ServiceConfig = common::config_loader::load_config(Some(file), ENV_PREFIX)?;
        config.validate()?;
        debug!("Service configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(AquaSrvError::config("service.name must not be empty"));
        }
        if self.storage.flash_path.trim().is_empty() {
            return Err(AquaSrvError::config("storage.flash_path must not be empty"));
        }
        if self.storage.fram_path.trim().is_empty() {
            return Err(AquaSrvError::config("storage.fram_path must not be empty"));
        }
        if UartSpeed::from_baud(self.serial.zigbee_baud).is_none() {
            return Err(AquaSrvError::config(format!(
                "serial.zigbee_baud {} is not a supported speed",
                self.serial.zigbee_baud
            )));
        }
        for (name, port) in [
            ("serial.modbus_port", &self.serial.modbus_port),
            ("serial.zigbee_port", &self.serial.zigbee_port),
            ("serial.console_port", &self.serial.console_port),
        ] {
            if matches!(port, Some(p) if p.trim().is_empty()) {
                return Err(AquaSrvError::config(format!("{} must not be empty", name)));
            }
        }
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(AquaSrvError::config(format!(
                "logging.level '{}' is not a log level",
                other
            ))),
        }
    }
}
