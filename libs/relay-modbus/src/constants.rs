//! Modbus-TCP protocol constants and engine defaults

use std::time::Duration;

/// Default Modbus-TCP port
pub const MODBUS_TCP_PORT: u16 = 502;

/// MBAP header length: transaction id (2) + protocol id (2) + length (2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Complete request length for the three supported functions:
/// header (6) + unit id (1) + function code (1) + address (2) + count/value (2)
pub const REQUEST_FRAME_LEN: usize = 12;

/// MBAP length field value for every supported request
pub const REQUEST_MBAP_LENGTH: u16 = 6;

/// Modbus-TCP protocol identifier
pub const PROTOCOL_ID: u16 = 0;

/// Fixed unit identifier used for every request
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Receive buffer ceiling; exceeding it means the stream is corrupt and the
/// buffer is discarded
pub const MAX_RECEIVE_BUFFER: usize = 4096;

/// Coil value pattern for ON
pub const COIL_ON: u16 = 0xFF00;
/// Coil value pattern for OFF
pub const COIL_OFF: u16 = 0x0000;

/// Maximum coils per read request (Modbus application protocol limit)
pub const MAX_READ_COILS: u16 = 2000;
/// Maximum registers per read request (Modbus application protocol limit)
pub const MAX_READ_REGISTERS: u16 = 125;

/// Exception responses carry the request function code with this bit set
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Default bounce/flash period (1200 ms)
pub const DEFAULT_BOUNCE: Duration = Duration::from_millis(1200);

/// Poll gap for read-only banks
pub const READ_ONLY_POLL_GAP: Duration = Duration::from_millis(80);

/// Poll gap for writable banks
pub const WRITABLE_POLL_GAP: Duration = Duration::from_millis(2000);

/// Default protocol-level response timeout
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval of the health status check
pub const DEFAULT_STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(75);

/// Grace period added to the status interval before a device counts as missing
pub const STATUS_MISSING_GRACE: Duration = Duration::from_secs(15);
