//! In-memory collaborators for driving a [`ModbusSession`] without IO
//!
//! [`ManualScheduler`] runs on virtual time: nothing fires until the test
//! calls [`run_for`] (or pops tasks itself), which makes timer-heavy flows
//! deterministic.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};

use crate::codec::FunctionCode;
use crate::constants::{COIL_OFF, COIL_ON, EXCEPTION_FLAG, PROTOCOL_ID};
use crate::session::{ModbusSession, Scheduler, Task, Transport};
use crate::signal::{EventSink, SignalValue};

/// Session type wired to the in-memory collaborators
pub type TestSession = ModbusSession<RecordingTransport, ManualScheduler, RecordingSink>;

/// Transport that records everything instead of sending it
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<Bytes>,
    pub drops: usize,
}

impl RecordingTransport {
    /// Decoded view of the most recent request
    pub fn last_request(&self) -> Option<SentRequest> {
        self.sent.last().and_then(|frame| SentRequest::parse(frame))
    }

    pub fn requests(&self) -> Vec<SentRequest> {
        self.sent.iter().filter_map(|frame| SentRequest::parse(frame)).collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, frame: Bytes) {
        self.sent.push(frame);
    }

    fn drop_connection(&mut self) {
        self.drops += 1;
    }
}

/// Fields of a 12-byte request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: u8,
    pub address: u16,
    pub value: u16,
}

impl SentRequest {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() != 12 {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            unit_id: frame[6],
            function: frame[7],
            address: u16::from_be_bytes([frame[8], frame[9]]),
            value: u16::from_be_bytes([frame[10], frame[11]]),
        })
    }
}

/// Virtual-time scheduler
#[derive(Debug)]
pub struct ManualScheduler {
    now: Instant,
    seq: u64,
    pending: Vec<(Instant, u64, Task)>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            seq: 0,
            pending: Vec::new(),
        }
    }

    /// Remove the earliest task due at or before `deadline`, moving the clock
    /// to its due time
    pub fn pop_due(&mut self, deadline: Instant) -> Option<Task> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, (at, _, _))| *at <= deadline)
            .min_by_key(|(_, (at, seq, _))| (*at, *seq))
            .map(|(index, _)| index)?;
        let (at, _, task) = self.pending.remove(index);
        self.now = self.now.max(at);
        Some(task)
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = self.now.max(now);
    }

    /// Tasks not yet delivered, with time remaining until each is due
    pub fn pending(&self) -> Vec<(Duration, Task)> {
        let mut tasks: Vec<_> = self
            .pending
            .iter()
            .map(|(at, seq, task)| (at.saturating_duration_since(self.now), *seq, *task))
            .collect();
        tasks.sort_by_key(|(remaining, seq, _)| (*remaining, *seq));
        tasks.into_iter().map(|(remaining, _, task)| (remaining, task)).collect()
    }

    pub fn has_pending(&self, task: Task) -> bool {
        self.pending.iter().any(|(_, _, pending)| *pending == task)
    }
}

impl Scheduler for ManualScheduler {
    fn run_after(&mut self, delay: Duration, task: Task) {
        self.seq += 1;
        self.pending.push((self.now + delay, self.seq, task));
    }

    fn now(&self) -> Instant {
        self.now
    }
}

/// Advance virtual time by `duration`, delivering every task that comes due
/// (including ones scheduled along the way)
pub fn run_for(session: &mut TestSession, duration: Duration) {
    let deadline = session.scheduler().now() + duration;
    while let Some(task) = session.scheduler_mut().pop_due(deadline) {
        session.on_task(task);
    }
    session.scheduler_mut().set_now(deadline);
}

/// Sink that records every published event in order
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<(String, SignalValue)>,
}

impl RecordingSink {
    pub fn count(&self, event: &str) -> usize {
        self.events.iter().filter(|(name, _)| name == event).count()
    }

    pub fn last(&self, event: &str) -> Option<&SignalValue> {
        self.events
            .iter()
            .rev()
            .find(|(name, _)| name == event)
            .map(|(_, value)| value)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&mut self, event: &str, value: &SignalValue) {
        self.events.push((event.to_string(), value.clone()));
    }
}

fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(7 + pdu.len());
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16((pdu.len() + 1) as u16);
    buf.put_u8(unit_id);
    buf.put_slice(pdu);
    buf.freeze()
}

/// READ_COILS response carrying `bits` (LSB first)
pub fn coils_response(transaction_id: u16, unit_id: u8, bits: &[bool]) -> Bytes {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    let mut pdu = vec![FunctionCode::ReadCoils.code(), packed.len() as u8];
    pdu.extend_from_slice(&packed);
    frame(transaction_id, unit_id, &pdu)
}

/// READ_HOLDING_REGISTERS response carrying `registers`
pub fn registers_response(transaction_id: u16, unit_id: u8, registers: &[u16]) -> Bytes {
    let mut pdu = vec![FunctionCode::ReadRegisters.code(), (registers.len() * 2) as u8];
    for register in registers {
        pdu.extend_from_slice(&register.to_be_bytes());
    }
    frame(transaction_id, unit_id, &pdu)
}

/// WRITE_SINGLE_COIL echo
pub fn write_coil_response(transaction_id: u16, unit_id: u8, address: u16, state: bool) -> Bytes {
    let value = if state { COIL_ON } else { COIL_OFF };
    let mut pdu = vec![FunctionCode::WriteSingleCoil.code()];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    frame(transaction_id, unit_id, &pdu)
}

/// Exception response for `function`
pub fn exception_response(transaction_id: u16, unit_id: u8, function: u8, code: u8) -> Bytes {
    frame(transaction_id, unit_id, &[function | EXCEPTION_FLAG, code])
}
