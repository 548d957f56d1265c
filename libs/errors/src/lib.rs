//! Workspace error type and the shared error capability trait
//!
//! Services define their own error enums and implement [`AquaErrorTrait`] on
//! them; [`AquaError`] is what crosses crate boundaries and decides the
//! process exit code.

use thiserror::Error;

/// Error shared between the controller crates
#[derive(Debug, Error)]
pub enum AquaError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// FRAM log or flash page could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored image failed its CRC
    #[error("Checksum mismatch: {context}")]
    Checksum { context: String },

    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    /// Serial port or bus failure
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    /// Latched valve fault (overload, no power, lost position)
    #[error("Actuator fault: {actuator}: {fault}")]
    Actuator { actuator: String, fault: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AquaResult<T> = Result<T, AquaError>;

impl AquaError {
    /// Exit status of a service binary failing with this error
    ///
    /// 2 for bad configuration or parameters, 3 for storage damage, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Validation => 2,
            ErrorCategory::Storage | ErrorCategory::DataCorruption => 3,
            _ => 1,
        }
    }
}

impl From<serde_yaml::Error> for AquaError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(format!("YAML: {}", err))
    }
}

impl From<std::num::ParseIntError> for AquaError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Validation(format!("Invalid integer: {}", err))
    }
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::AquaError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::AquaError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::AquaError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::AquaError::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($protocol:expr, $msg:expr) => {
        $crate::AquaError::Protocol {
            protocol: $protocol.to_string(),
            message: $msg.to_string(),
        }
    };
}

impl AquaErrorTrait for AquaError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Checksum { .. } => "CHECKSUM_MISMATCH",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Actuator { .. } => "ACTUATOR_FAULT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Checksum { .. } => ErrorCategory::DataCorruption,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Communication(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Actuator { .. } => ErrorCategory::Actuator,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Io(_) | Self::Internal(_) => ErrorCategory::Internal,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

/// Coarse classification driving retry, logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Storage,
    DataCorruption,
    Timeout,
    Connection,
    Protocol,
    Actuator,
    Internal,
    Unknown,
}

impl ErrorCategory {
    /// Delay before a retry, `None` when retrying cannot help
    pub fn retry_delay(self) -> Option<std::time::Duration> {
        let ms = match self {
            Self::Timeout => 500,
            Self::Connection => 1500,
            _ => return None,
        };
        Some(std::time::Duration::from_millis(ms))
    }
}

/// Common interface of the service error types
pub trait AquaErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable code for logs
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    fn is_retryable(&self) -> bool {
        self.category().retry_delay().is_some()
    }

    fn retry_delay_ms(&self) -> u64 {
        self.category()
            .retry_delay()
            .map_or(0, |d| d.as_millis() as u64)
    }

    fn log_level(&self) -> tracing::Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Storage | ErrorCategory::DataCorruption => {
                tracing::Level::ERROR
            },
            ErrorCategory::Validation => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
    }

    /// Faults an operator has to look at: damaged storage, stuck valves, internal errors
    fn should_alert(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Internal
                | ErrorCategory::Storage
                | ErrorCategory::DataCorruption
                | ErrorCategory::Actuator
        )
    }
}

/// Log `err` at its own level, tagged with its code and alert flag
pub fn report<E: AquaErrorTrait>(context: &str, err: &E) {
    let code = err.error_code();
    let alert = err.should_alert();
    match err.log_level() {
        tracing::Level::ERROR => tracing::error!(code, alert, "{}: {}", context, err),
        tracing::Level::WARN => tracing::warn!(code, alert, "{}: {}", context, err),
        tracing::Level::INFO => tracing::info!(code, alert, "{}: {}", context, err),
        _ => tracing::debug!(code, alert, "{}: {}", context, err),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_retry_follows_category() {
        let err = AquaError::Timeout("radio".into());
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_ms(), 500);
        assert!(!AquaError::Validation("test".into()).is_retryable());
        assert!(!AquaError::Checksum {
            context: "block 0x0020".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_actuator_fault_alerts() {
        let err = AquaError::Actuator {
            actuator: "cold".into(),
            fault: "Overload".into(),
        };
        assert_eq!(err.error_code(), "ACTUATOR_FAULT");
        assert!(err.should_alert());
        assert_eq!(err.log_level(), tracing::Level::WARN);
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_checksum_exit_code() {
        let err = AquaError::Checksum {
            context: "flash page".into(),
        };
        assert_eq!(err.category(), ErrorCategory::DataCorruption);
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_macros() {
        let err = config_error!("missing {}", "flash_path");
        assert_eq!(err.to_string(), "Configuration error: missing flash_path");
        assert_eq!(err.exit_code(), 2);

        let err = protocol_error!("modbus", "bad frame");
        assert_eq!(err.to_string(), "Protocol error: modbus: bad frame");
        assert_eq!(err.retry_delay_ms(), 0);
    }

    #[test]
    #[traced_test]
    fn test_report_uses_error_level() {
        report("flash page", &AquaError::Checksum { context: "page 3".into() });
        assert!(logs_contain("ERROR"));
        assert!(logs_contain("CHECKSUM_MISMATCH"));
        assert!(logs_contain("flash page: Checksum mismatch: page 3"));

        report("settings", &validation_error!("bad {}", "rate"));
        assert!(logs_contain("INFO"));
        assert!(logs_contain("settings: Validation failed: bad rate"));
    }

    #[test]
    fn test_parse_int_is_validation() {
        let err: AquaError = "x1".parse::<u32>().unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
