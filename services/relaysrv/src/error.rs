//! Error handling for the relay service

use relay_modbus::ModbusError;
use thiserror::Error;

/// Relay service error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelaySrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// Errors reported by the Modbus engine
    #[error("Modbus error: {0}")]
    Modbus(#[from] ModbusError),

    /// The event loop is gone
    #[error("Service stopped")]
    ServiceStopped,

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for RelaySrvError {
    fn from(err: std::io::Error) -> Self {
        RelaySrvError::Io(err.to_string())
    }
}

impl From<figment::Error> for RelaySrvError {
    fn from(err: figment::Error) -> Self {
        RelaySrvError::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<serde_yaml::Error> for RelaySrvError {
    fn from(err: serde_yaml::Error) -> Self {
        RelaySrvError::Config(format!("YAML error: {}", err))
    }
}

impl From<serde_json::Error> for RelaySrvError {
    fn from(err: serde_json::Error) -> Self {
        RelaySrvError::Io(format!("JSON error: {}", err))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelaySrvError>;
