//! Error handling for the controller service
//!
//! Subsystems keep their own status enums (`FramError`, `ModbusError`, `CanError`,
//! `ZbError`, `ConfigError`) whose `Display` text is the operator-facing description.
//! `AquaSrvError` aggregates them at the service boundary.

use errors::{AquaError, AquaErrorTrait, ErrorCategory};
use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::fram::FramError;

/// Controller service error type
#[derive(Error, Debug, Clone)]
pub enum AquaSrvError {
    /// Service or device configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors (files, serial ports)
    #[error("IO error: {0}")]
    IoError(String),

    /// FRAM log and flash page errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Wire protocol errors (MODBUS, CAN, ZigBee)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Latched valve faults
    #[error("Actuator error: {0}")]
    ActuatorError(String),

    /// Parameter validation errors
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the controller service
pub type Result<T> = std::result::Result<T, AquaSrvError>;

impl AquaSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        AquaSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        AquaSrvError::IoError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        AquaSrvError::StorageError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        AquaSrvError::ProtocolError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        AquaSrvError::TimeoutError(msg.into())
    }

    pub fn actuator(msg: impl Into<String>) -> Self {
        AquaSrvError::ActuatorError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AquaSrvError::ValidationError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AquaSrvError::InternalError(msg.into())
    }
}

// ============================================================================
// From implementations for external and subsystem error types
// ============================================================================

impl From<std::io::Error> for AquaSrvError {
    fn from(err: std::io::Error) -> Self {
        AquaSrvError::IoError(err.to_string())
    }
}

impl From<tokio_serial::Error> for AquaSrvError {
    fn from(err: tokio_serial::Error) -> Self {
        AquaSrvError::IoError(format!("Serial port: {}", err))
    }
}

impl From<serde_yaml::Error> for AquaSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        AquaSrvError::ConfigError(err.to_string())
    }
}

impl From<FramError> for AquaSrvError {
    fn from(err: FramError) -> Self {
        match err {
            FramError::Timeout => AquaSrvError::TimeoutError("FRAM".to_string()),
            other => AquaSrvError::StorageError(format!("FRAM: {}", other)),
        }
    }
}

impl From<ConfigError> for AquaSrvError {
    fn from(err: ConfigError) -> Self {
        AquaSrvError::ConfigError(err.to_string())
    }
}

impl From<errors::AquaError> for AquaSrvError {
    fn from(err: errors::AquaError) -> Self {
        match err.category() {
            ErrorCategory::Configuration => AquaSrvError::ConfigError(err.to_string()),
            ErrorCategory::Validation => AquaSrvError::ValidationError(err.to_string()),
            ErrorCategory::Storage | ErrorCategory::DataCorruption => {
                AquaSrvError::StorageError(err.to_string())
            },
            ErrorCategory::Timeout => AquaSrvError::TimeoutError(err.to_string()),
            _ => AquaSrvError::InternalError(err.to_string()),
        }
    }
}

impl From<AquaSrvError> for AquaError {
    fn from(err: AquaSrvError) -> Self {
        match err {
            AquaSrvError::ConfigError(msg) => errors::config_error!(msg),
            AquaSrvError::IoError(msg) => AquaError::Communication(msg),
            AquaSrvError::StorageError(msg) => AquaError::Storage(msg),
            AquaSrvError::ProtocolError(msg) => errors::protocol_error!("aquasrv", msg),
            AquaSrvError::TimeoutError(msg) => AquaError::Timeout(msg),
            AquaSrvError::ActuatorError(msg) => AquaError::Actuator {
                actuator: "valve".to_string(),
                fault: msg,
            },
            AquaSrvError::ValidationError(msg) => errors::validation_error!(msg),
            AquaSrvError::InternalError(msg) => AquaError::Internal(msg),
        }
    }
}

// ============================================================================
// AquaErrorTrait implementation
// ============================================================================

impl AquaErrorTrait for AquaSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            AquaSrvError::ConfigError(_) => "AQUASRV_CONFIG",
            AquaSrvError::IoError(_) => "AQUASRV_IO",
            AquaSrvError::StorageError(_) => "AQUASRV_STORAGE",
            AquaSrvError::ProtocolError(_) => "AQUASRV_PROTOCOL",
            AquaSrvError::TimeoutError(_) => "AQUASRV_TIMEOUT",
            AquaSrvError::ActuatorError(_) => "AQUASRV_ACTUATOR",
            AquaSrvError::ValidationError(_) => "AQUASRV_VALIDATION",
            AquaSrvError::InternalError(_) => "AQUASRV_INTERNAL",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            AquaSrvError::ConfigError(_) => ErrorCategory::Configuration,
            AquaSrvError::IoError(_) => ErrorCategory::Connection,
            AquaSrvError::StorageError(_) => ErrorCategory::Storage,
            AquaSrvError::ProtocolError(_) => ErrorCategory::Protocol,
            AquaSrvError::TimeoutError(_) => ErrorCategory::Timeout,
            AquaSrvError::ActuatorError(_) => ErrorCategory::Actuator,
            AquaSrvError::ValidationError(_) => ErrorCategory::Validation,
            AquaSrvError::InternalError(_) => ErrorCategory::Internal,
        }
    }
}

/// Context helpers for foreign results
pub trait ErrorExt<T> {
    fn config_error(self, context: &str) -> Result<T>;
    fn io_error(self, context: &str) -> Result<T>;
    fn protocol_error(self, context: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, context: &str) -> Result<T> {
        self.map_err(|e| AquaSrvError::ConfigError(format!("{}: {}", context, e)))
    }

    fn io_error(self, context: &str) -> Result<T> {
        self.map_err(|e| AquaSrvError::IoError(format!("{}: {}", context, e)))
    }

    fn protocol_error(self, context: &str) -> Result<T> {
        self.map_err(|e| AquaSrvError::ProtocolError(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_fram_timeout_maps_to_timeout() {
        let err: AquaSrvError = FramError::Timeout.into();
        assert!(matches!(err, AquaSrvError::TimeoutError(_)));
        assert!(err.is_retryable());

        let err: AquaSrvError = FramError::Crc.into();
        assert_eq!(err.error_code(), "AQUASRV_STORAGE");
        assert!(err.should_alert());
    }

    #[test]
    fn test_conversion_to_workspace_error() {
        let err: AquaError = AquaSrvError::actuator("Overload").into();
        assert!(matches!(err, AquaError::Actuator { .. }));
        assert_eq!(err.exit_code(), 1);

        let err: AquaError = AquaSrvError::config("bad port").into();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_error_ext_context() {
        let res: std::result::Result<u8, String> = Err("eof".to_string());
        let err = res.io_error("flash page").unwrap_err();
        assert_eq!(err.to_string(), "IO error: flash page: eof");
    }
}
