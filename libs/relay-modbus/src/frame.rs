//! Modbus-TCP stream framing
//!
//! TCP delivers an unbounded byte stream; a single read may carry a fragment
//! of a response, exactly one response, or several coalesced responses. The
//! [`FrameAssembler`] buffers incoming bytes and cuts complete
//! length-delimited MBAP frames out of the front of the buffer.
//!
//! ```text
//! 00:93   00:00   00:05   01:01:02:fd:0f
//! TID     PID     LEN     LEN bytes (unit, function, body)
//! ```

use bytes::{Bytes, BytesMut};
use std::fmt;
use tracing::warn;

use crate::constants::{MAX_RECEIVE_BUFFER, MBAP_HEADER_LEN};

/// One complete Modbus-TCP frame: 6-byte MBAP header followed by `length`
/// bytes of payload
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Wrap raw bytes; returns `None` if the bytes are not exactly one frame
    pub fn from_bytes(data: impl Into<Bytes>) -> Option<Self> {
        let data = data.into();
        if data.len() < MBAP_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        (data.len() == MBAP_HEADER_LEN + length).then_some(Self(data))
    }

    pub fn transaction_id(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn protocol_id(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    /// MBAP length field (bytes following the header)
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    /// Everything after the MBAP header: unit id, function code, body
    pub fn payload(&self) -> &[u8] {
        &self.0[MBAP_HEADER_LEN..]
    }

    pub fn unit_id(&self) -> Option<u8> {
        self.payload().first().copied()
    }

    pub fn function_code(&self) -> Option<u8> {
        self.payload().get(1).copied()
    }

    /// Function-specific body following the function code
    pub fn body(&self) -> &[u8] {
        self.payload().get(2..).unwrap_or(&[])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("tid", &format_args!("{:#06X}", self.transaction_id()))
            .field("len", &self.length())
            .field("payload", &format_args!("{:02X?}", self.payload()))
            .finish()
    }
}

/// Receive-side reassembly buffer
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
    overflows: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            overflows: 0,
        }
    }

    /// Append received bytes and iterate the complete frames now available.
    ///
    /// The returned iterator is lazy; frames it does not yield stay buffered
    /// and are produced by the next call.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_RECEIVE_BUFFER {
            warn!(
                "Receive buffer too large ({}B), possible protocol corruption; dropping it",
                self.buffer.len()
            );
            self.overflows += 1;
            self.buffer.clear();
        }

        Frames {
            buffer: &mut self.buffer,
        }
    }

    /// Discard any partially received bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently held waiting for the rest of a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of times the buffer ceiling was hit
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

/// Iterator over complete frames at the front of the receive buffer
#[derive(Debug)]
pub struct Frames<'a> {
    buffer: &'a mut BytesMut,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.buffer.len() < MBAP_HEADER_LEN {
            return None;
        }

        let length = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
        let full_length = MBAP_HEADER_LEN + length;
        if self.buffer.len() < full_length {
            return None;
        }

        Some(Frame(self.buffer.split_to(full_length).freeze()))
    }
}
