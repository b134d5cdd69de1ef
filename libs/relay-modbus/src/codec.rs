//! Modbus request encoding and response decoding
//!
//! Only the three functions a relay/DI module needs are supported:
//! FC01 (read coils), FC03 (read holding registers) and FC05 (write single coil).

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::constants::{
    COIL_OFF, COIL_ON, DEFAULT_UNIT_ID, EXCEPTION_FLAG, MAX_READ_COILS, MAX_READ_REGISTERS,
    PROTOCOL_ID, REQUEST_FRAME_LEN, REQUEST_MBAP_LENGTH,
};
use crate::error::{ModbusError, Result};
use crate::frame::Frame;

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadRegisters = 0x03,
    WriteSingleCoil = 0x05,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x03 => Some(Self::ReadRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "READ_COILS",
            Self::ReadRegisters => "READ_REGISTERS",
            Self::WriteSingleCoil => "WRITE_COIL",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(FC{:02X})", self.name(), self.code())
    }
}

/// An encoded-on-demand request with its transaction id already assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: FunctionCode,
    /// Start address (reads) or coil address (write)
    pub address: u16,
    /// Item count (reads) or coil value pattern (write)
    pub value: u16,
}

impl Request {
    /// Number of items the response must carry (0 for writes)
    pub fn expected_count(&self) -> u16 {
        match self.function {
            FunctionCode::ReadCoils | FunctionCode::ReadRegisters => self.value,
            FunctionCode::WriteSingleCoil => 0,
        }
    }

    /// Wire bytes: MBAP header, unit id, function code, address, count/value
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(REQUEST_FRAME_LEN);
        frame.put_u16(self.transaction_id);
        frame.put_u16(PROTOCOL_ID);
        frame.put_u16(REQUEST_MBAP_LENGTH);
        frame.put_u8(self.unit_id);
        frame.put_u8(self.function.code());
        frame.put_u16(self.address);
        frame.put_u16(self.value);
        frame.freeze()
    }
}

/// Decoded response value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Coil states in address order
    Coils(Vec<bool>),
    /// Register values in address order
    Registers(Vec<u16>),
    /// Confirmed coil state echoed by the device
    CoilWritten(bool),
}

/// Request builder owning the transaction id counter
#[derive(Debug)]
pub struct ModbusCodec {
    next_transaction_id: u16,
    unit_id: u8,
}

impl Default for ModbusCodec {
    fn default() -> Self {
        Self::new(DEFAULT_UNIT_ID)
    }
}

impl ModbusCodec {
    pub fn new(unit_id: u8) -> Self {
        Self {
            next_transaction_id: 1,
            unit_id,
        }
    }

    /// Next transaction id; wraps from 0xFFFF to 0x0000
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    pub fn read_coils(&mut self, start_address: u16, count: u16) -> Result<Request> {
        check_count(FunctionCode::ReadCoils, start_address, count, MAX_READ_COILS)?;
        Ok(self.request(FunctionCode::ReadCoils, start_address, count))
    }

    pub fn read_registers(&mut self, start_address: u16, count: u16) -> Result<Request> {
        check_count(
            FunctionCode::ReadRegisters,
            start_address,
            count,
            MAX_READ_REGISTERS,
        )?;
        Ok(self.request(FunctionCode::ReadRegisters, start_address, count))
    }

    pub fn write_coil(&mut self, address: u16, state: bool) -> Request {
        let value = if state { COIL_ON } else { COIL_OFF };
        self.request(FunctionCode::WriteSingleCoil, address, value)
    }

    fn request(&mut self, function: FunctionCode, address: u16, value: u16) -> Request {
        Request {
            transaction_id: self.next_transaction_id(),
            unit_id: self.unit_id,
            function,
            address,
            value,
        }
    }
}

fn check_count(function: FunctionCode, start: u16, count: u16, max: u16) -> Result<()> {
    if count == 0 || count > max {
        return Err(ModbusError::InvalidRequest(format!(
            "{function} count {count} not in 1..={max}"
        )));
    }
    if u32::from(start) + u32::from(count) > 0x1_0000 {
        return Err(ModbusError::InvalidRequest(format!(
            "{function} range {start}+{count} exceeds address space"
        )));
    }
    Ok(())
}

/// Decode a response frame for a request of `function` expecting
/// `expected_count` items
pub fn decode(frame: &Frame, function: FunctionCode, expected_count: u16) -> Result<Response> {
    let actual = frame
        .function_code()
        .ok_or_else(|| ModbusError::Malformed(format!("frame too short: {}B", frame.len())))?;

    if actual == function.code() | EXCEPTION_FLAG {
        let code = frame.body().first().copied().ok_or_else(|| {
            ModbusError::Malformed("exception response without exception code".to_string())
        })?;
        return Err(ModbusError::Exception {
            function: function.code(),
            code,
        });
    }

    if actual != function.code() {
        return Err(ModbusError::UnexpectedFunction {
            expected: function.code(),
            actual,
        });
    }

    let body = frame.body();
    let response = match function {
        FunctionCode::ReadCoils => Response::Coils(unpack_coils(body, expected_count)?),
        FunctionCode::ReadRegisters => Response::Registers(unpack_registers(body, expected_count)?),
        FunctionCode::WriteSingleCoil => {
            if body.len() < 4 {
                return Err(ModbusError::Malformed(format!(
                    "write coil echo too short: {}B",
                    body.len()
                )));
            }
            let payload = frame.payload();
            let state = payload[payload.len() - 2..] == COIL_ON.to_be_bytes();
            Response::CoilWritten(state)
        },
    };

    debug!(
        "{} resp: tid:{} protID:{} len:{} unit:{} count:{} {}",
        function.name(),
        frame.transaction_id(),
        frame.protocol_id(),
        frame.length(),
        frame.unit_id().unwrap_or(0),
        expected_count,
        describe_values(&response)
    );

    Ok(response)
}

/// Body: byte count, then packed bits, LSB first within each byte
fn unpack_coils(body: &[u8], count: u16) -> Result<Vec<bool>> {
    let data = counted_data(body)?;
    let count = count as usize;
    if data.len() * 8 < count {
        return Err(ModbusError::Malformed(format!(
            "coil response carries {} bits, expected {}",
            data.len() * 8,
            count
        )));
    }

    Ok(data
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
        .take(count)
        .collect())
}

/// Body: byte count, then big-endian u16 values
fn unpack_registers(body: &[u8], count: u16) -> Result<Vec<u16>> {
    let data = counted_data(body)?;
    let count = count as usize;
    if data.len() < count * 2 {
        return Err(ModbusError::Malformed(format!(
            "register response carries {}B, expected {}",
            data.len(),
            count * 2
        )));
    }

    Ok(data[..count * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn counted_data(body: &[u8]) -> Result<&[u8]> {
    let (&byte_count, rest) = body
        .split_first()
        .ok_or_else(|| ModbusError::Malformed("missing byte count".to_string()))?;
    rest.get(..byte_count as usize).ok_or_else(|| {
        ModbusError::Malformed(format!(
            "byte count {} exceeds remaining {}B",
            byte_count,
            rest.len()
        ))
    })
}

fn describe_values(response: &Response) -> String {
    match response {
        Response::Coils(bits) => format!(
            "bits:{}",
            bits.iter().map(|b| if *b { '1' } else { '0' }).collect::<String>()
        ),
        Response::Registers(values) => format!("registers:{values:?}"),
        Response::CoilWritten(state) => format!("state:{state}"),
    }
}
