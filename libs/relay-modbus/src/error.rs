//! Error types for the Modbus transaction engine

use thiserror::Error;

/// Modbus engine error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Frame too short or internally inconsistent
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Response carried a different function code than the request
    #[error("Unexpected function code: expected {expected:#04X}, got {actual:#04X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    /// Device answered with a Modbus exception
    #[error("Modbus exception {code:#04X} ({}) for function {function:#04X}", describe(.code))]
    Exception { function: u8, code: u8 },

    /// No response within the protocol timeout
    #[error("No response to transaction {0:#06X} within protocol timeout")]
    Timeout(u16),

    /// The request was discarded because the connection went away
    #[error("Connection lost before response")]
    ConnectionLost,

    /// The transport is not connected
    #[error("Not connected")]
    NotConnected,

    /// Request parameters out of range
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No writable coil with that name or label
    #[error("Unknown coil: {0}")]
    UnknownCoil(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, ModbusError>;

fn describe(code: &u8) -> &'static str {
    exception_description(*code)
}

/// Standard description of a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
