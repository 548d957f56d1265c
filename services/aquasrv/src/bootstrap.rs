//! Service bootstrap
//!
//! This module handles service initialization including:
//! - Command-line arguments
//! - Logging configuration
//! - Configuration validation

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info, warn};

use crate::config::store::load_device_config;
use crate::config::{FileConfigStore, FlashStatus, ServiceConfig};
use crate::error::{AquaSrvError, Result};

/// Command-line arguments for aquasrv
#[derive(Parser, Clone, Debug)]
#[command(
    name = "aquasrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Water Meter and Valve Controller Service",
    long_about = None
)]
pub struct Args {
    /// Service configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Enable the debug console verbs
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Run against the in-process simulated board
    #[arg(long)]
    pub simulate: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Fold the command-line switches into the loaded configuration
    pub fn apply(&self, config: &mut ServiceConfig) -> Result<()> {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.debug {
            config.service.debug = true;
        }
        if self.simulate {
            config.service.simulate = true;
        }
        config.validate()
    }
}

/// Initialize logging from the service configuration
///
/// Log root directory priority:
/// 1. AQUA_LOG_DIR environment variable
/// 2. logging.dir from the configuration
/// 3. Default "logs"
pub fn initialize_logging(args: &Args, config: &ServiceConfig) -> Result<()> {
    common::logging::init_log_root(config.logging.dir.as_deref());

    let level = config
        .logging
        .level
        .parse::<tracing::Level>()
        .map_err(|e| AquaSrvError::config(format!("Invalid log level: {}", e)))?;

    let log_config = common::logging::LogConfig {
        service_name: config.service.name.clone(),
        log_dir: common::logging::get_log_root().join(&config.service.name),
        level,
        enable_file: config.logging.file,
        enable_json: config.logging.json,
        ansi: !args.no_color,
    };

    common::logging::init_with_config(log_config)
        .map_err(|e| AquaSrvError::config(format!("Failed to init logging: {}", e)))
}

/// Report the service configuration and the stored device configuration
pub fn validate_configuration(config: &ServiceConfig) -> Result<()> {
    debug!("Validating configuration");
    config.validate()?;
    info!("Service: {}", config.service.name);
    info!(
        "Storage: flash {} FRAM {}",
        config.storage.flash_path, config.storage.fram_path
    );
    for (name, port) in [
        ("MODBUS", &config.serial.modbus_port),
        ("ZigBee", &config.serial.zigbee_port),
        ("Console", &config.serial.console_port),
    ] {
        info!("  {} port: {}", name, port.as_deref().unwrap_or("-"));
    }
    info!("  CAN backend: {:?}", config.can.backend);

    let (device, status) = load_device_config(&FileConfigStore::new(&config.storage.flash_path));
    match status {
        FlashStatus::Ok => info!("Device configuration: OK"),
        other => warn!("Device configuration: {} (defaults in use)", other),
    }
    info!(
        "  MODBUS id 0x{:02X} @ {}, CAN id 0x{:X} @ {} kbit/s",
        device.modbus_id(),
        device.modbus_speed().baud(),
        device.can_id(),
        device.can_speed().kbit()
    );
    info!("Configuration validation completed successfully");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from(["aquasrv", "-l", "debug", "--debug", "--no-color"]);
        let mut config = ServiceConfig::default();
        config.service.simulate = false;
        args.apply(&mut config).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.service.simulate);
        assert!(config.service.debug);
        assert!(args.no_color);
    }

    #[test]
    fn test_simulate_flag() {
        let args = Args::parse_from(["aquasrv", "--simulate"]);
        let mut config = ServiceConfig::default();
        config.service.simulate = false;
        args.apply(&mut config).unwrap();
        assert!(config.service.simulate);
    }

    #[test]
    fn test_args_reject_bad_level() {
        let args = Args::parse_from(["aquasrv", "--log-level", "chatty"]);
        assert!(args.apply(&mut ServiceConfig::default()).is_err());
    }

    #[test]
    fn test_validate_with_blank_flash() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::default();
        config.storage.flash_path = dir.path().join("flash.bin").display().to_string();
        validate_configuration(&config).unwrap();
    }
}
