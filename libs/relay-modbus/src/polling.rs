//! Continuous bank polling
//!
//! One self-rescheduling loop per bank. Every continuation carries the
//! connection epoch it was created under; when the live epoch has moved on
//! (a disconnect happened) the continuation aborts and is never rescheduled.
//! No explicit cancellation is needed: the next connect starts fresh loops at
//! the new epoch and the old ones stay inert.

use std::time::Duration;
use tracing::debug;

use crate::codec::{ModbusCodec, Request, Response};
use crate::constants::{READ_ONLY_POLL_GAP, WRITABLE_POLL_GAP};
use crate::error::{ModbusError, Result};
use crate::profile::{AddressBank, BankKind};
use crate::signal::{EventSink, Signal, SignalValue};

/// Loop state of one bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Not started (no connection yet)
    Idle,
    /// Read request queued or in flight
    Requesting,
    /// Response handled, waiting for the poll gap
    Scheduled,
    /// Loop belonged to an earlier connection epoch and has stopped
    Aborted,
}

/// Poll gaps per bank type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub read_only: Duration,
    pub writable: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            read_only: READ_ONLY_POLL_GAP,
            writable: WRITABLE_POLL_GAP,
        }
    }
}

/// One polled bank and the signals of its items
#[derive(Debug)]
pub struct BankPoller {
    pub bank: AddressBank,
    /// Signal index per item, in address order
    pub signals: Vec<usize>,
    /// Per-item display inversion (coils only)
    pub invert: Vec<bool>,
    state: PollState,
    epoch: u64,
    polls: u64,
}

impl BankPoller {
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Epoch of the loop currently driving this bank
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Successful polls since startup
    pub fn polls(&self) -> u64 {
        self.polls
    }
}

/// Owner of all bank loops
#[derive(Debug, Default)]
pub struct PollingEngine {
    banks: Vec<BankPoller>,
    timing: PollTiming,
}

impl PollingEngine {
    pub fn new(timing: PollTiming) -> Self {
        Self {
            banks: Vec::new(),
            timing,
        }
    }

    pub fn add(&mut self, bank: AddressBank, signals: Vec<usize>, invert: Vec<bool>) -> usize {
        self.banks.push(BankPoller {
            bank,
            signals,
            invert,
            state: PollState::Idle,
            epoch: 0,
            polls: 0,
        });
        self.banks.len() - 1
    }

    pub fn banks(&self) -> &[BankPoller] {
        &self.banks
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    pub fn state(&self, bank: usize) -> Option<PollState> {
        self.banks.get(bank).map(BankPoller::state)
    }

    /// Delay before the next read of `bank`
    pub fn gap(&self, bank: usize) -> Duration {
        match self.banks.get(bank) {
            Some(poller) if poller.bank.is_writable() => self.timing.writable,
            _ => self.timing.read_only,
        }
    }

    /// Mark every loop as started under `epoch`
    pub fn start_all(&mut self, epoch: u64) {
        for poller in &mut self.banks {
            poller.epoch = epoch;
            poller.state = PollState::Scheduled;
        }
    }

    /// Epoch check performed by every continuation before acting. Returns
    /// false (and marks the loop aborted) when the continuation is stale.
    pub fn admit(&mut self, bank: usize, epoch: u64, live_epoch: u64) -> bool {
        if epoch == live_epoch {
            return true;
        }
        debug!("(connection {} ended, bank {} loop stops)", epoch, bank);
        if let Some(poller) = self.banks.get_mut(bank) {
            if poller.epoch == epoch {
                poller.state = PollState::Aborted;
            }
        }
        false
    }

    /// Build the read request for `bank`
    pub fn request(&mut self, bank: usize, codec: &mut ModbusCodec) -> Result<Request> {
        let poller = self
            .banks
            .get_mut(bank)
            .ok_or_else(|| ModbusError::InvalidRequest(format!("no bank {bank}")))?;
        let request = match poller.bank.kind {
            BankKind::Coil => codec.read_coils(poller.bank.start_address, poller.bank.count)?,
            BankKind::Register => {
                codec.read_registers(poller.bank.start_address, poller.bank.count)?
            },
        };
        poller.state = PollState::Requesting;
        Ok(request)
    }

    /// Apply a poll response to the bank's signals, emitting only changed
    /// items. Returns the number of events emitted.
    pub fn apply(
        &mut self,
        bank: usize,
        response: &Response,
        signals: &mut [Signal],
        sink: &mut dyn EventSink,
    ) -> usize {
        let Some(poller) = self.banks.get_mut(bank) else {
            return 0;
        };
        poller.polls += 1;

        let values: Vec<SignalValue> = match response {
            Response::Coils(bits) => bits
                .iter()
                .zip(poller.invert.iter().chain(std::iter::repeat(&false)))
                .map(|(bit, invert)| SignalValue::Bool(*bit != *invert))
                .collect(),
            Response::Registers(registers) => {
                registers.iter().copied().map(SignalValue::Integer).collect()
            },
            Response::CoilWritten(_) => Vec::new(),
        };

        let mut changed = 0;
        for (&signal, value) in poller.signals.iter().zip(values) {
            if let Some(signal) = signals.get_mut(signal) {
                if signal.emit_if_changed(value, sink) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Mark the loop as waiting for its next step
    pub fn scheduled(&mut self, bank: usize) {
        if let Some(poller) = self.banks.get_mut(bank) {
            poller.state = PollState::Scheduled;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<(String, SignalValue)>);

    impl EventSink for Recorder {
        fn publish(&mut self, event: &str, value: &SignalValue) {
            self.0.push((event.to_string(), value.clone()));
        }
    }

    fn engine_with_inputs() -> (PollingEngine, Vec<Signal>) {
        let bank = AddressBank::coils(0, 3, "Input", true);
        let signals: Vec<Signal> = (0..3)
            .map(|i| Signal::new(format!("{} State", bank.point_name(i))))
            .collect();
        let mut engine = PollingEngine::new(PollTiming::default());
        engine.add(bank, vec![0, 1, 2], vec![false, true, false]);
        (engine, signals)
    }

    #[test]
    fn test_gap_per_bank_type() {
        let mut engine = PollingEngine::new(PollTiming::default());
        engine.add(AddressBank::coils(0, 6, "Input", true), vec![], vec![]);
        engine.add(AddressBank::coils(16, 6, "Relay", false), vec![], vec![]);
        engine.add(AddressBank::registers(0, 2, "AI"), vec![], vec![]);

        assert_eq!(engine.gap(0), Duration::from_millis(80));
        assert_eq!(engine.gap(1), Duration::from_millis(2000));
        assert_eq!(engine.gap(2), Duration::from_millis(80));
    }

    #[test]
    fn test_stale_epoch_aborts() {
        let (mut engine, _) = engine_with_inputs();
        engine.start_all(3);
        assert!(engine.admit(0, 3, 3));
        assert!(!engine.admit(0, 3, 4));
        assert_eq!(engine.state(0), Some(PollState::Aborted));
    }

    #[test]
    fn test_old_loop_does_not_abort_new_one() {
        let (mut engine, _) = engine_with_inputs();
        engine.start_all(1);
        engine.start_all(2);
        assert!(!engine.admit(0, 1, 2));
        assert_eq!(engine.state(0), Some(PollState::Scheduled));
    }

    #[test]
    fn test_request_matches_bank() {
        let (mut engine, _) = engine_with_inputs();
        let mut codec = ModbusCodec::new(1);
        let request = engine.request(0, &mut codec).unwrap();
        assert_eq!(request.address, 0);
        assert_eq!(request.expected_count(), 3);
        assert_eq!(engine.state(0), Some(PollState::Requesting));
    }

    #[test]
    fn test_apply_emits_only_changes() {
        let (mut engine, mut signals) = engine_with_inputs();
        let mut sink = Recorder::default();

        let response = Response::Coils(vec![true, true, false]);
        assert_eq!(engine.apply(0, &response, &mut signals, &mut sink), 3);
        assert_eq!(engine.apply(0, &response, &mut signals, &mut sink), 0);

        let response = Response::Coils(vec![true, true, true]);
        assert_eq!(engine.apply(0, &response, &mut signals, &mut sink), 1);
        assert_eq!(sink.0.len(), 4);
        assert_eq!(engine.banks()[0].polls(), 3);
    }

    #[test]
    fn test_apply_honours_invert() {
        let (mut engine, mut signals) = engine_with_inputs();
        let mut sink = Recorder::default();
        engine.apply(0, &Response::Coils(vec![true, true, true]), &mut signals, &mut sink);
        assert_eq!(
            sink.0[1],
            ("Input 2 State".to_string(), SignalValue::Bool(false))
        );
    }
}
