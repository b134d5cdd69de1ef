//! Modbus session: the transaction engine bound to its host collaborators
//!
//! ```text
//! transport bytes ──► FrameAssembler ──► TransactionQueue::dispatch ──► decode
//!                                                                      │
//!        ┌──────────── PollingEngine / OutputController ◄──────────────┘
//!        │
//!        └──► ModbusCodec ──► TransactionQueue::enqueue ──► Transport::send
//! ```
//!
//! All state lives in [`ModbusSession`] and is mutated from a single event
//! thread. Deferred work is expressed as [`Task`] values handed to the
//! [`Scheduler`]; tasks cannot be cancelled, so each one validates itself
//! when delivered (poll epoch, request ticket, timer generation).

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::{self, ModbusCodec, Request, Response};
use crate::constants::{
    DEFAULT_BOUNCE, DEFAULT_PROTOCOL_TIMEOUT, DEFAULT_STATUS_CHECK_INTERVAL, DEFAULT_UNIT_ID,
};
use crate::error::{ModbusError, Result};
use crate::frame::{Frame, FrameAssembler};
use crate::output::{ActionPlan, CoilAction, OutputController};
use crate::polling::{PollTiming, PollingEngine};
use crate::profile::{AddressBank, BankKind, PointOptions};
use crate::queue::{Dispatch, TransactionQueue};
use crate::signal::{EventSink, Signal, SignalValue};
use crate::status::{HealthReport, StatusMonitor};

/// Event name of the health status
pub const STATUS_EVENT: &str = "Status";
/// Event name of the transaction-id mismatch counter
pub const SYNC_ERRORS_EVENT: &str = "Sync Errors";
/// Event name of the last detected contact
pub const LAST_CONTACT_EVENT: &str = "Last Contact Detect";

/// Byte-stream transport to the device
pub trait Transport {
    /// Queue bytes for transmission
    fn send(&mut self, frame: Bytes);
    /// Force the connection down; the host reports `on_disconnected` later
    fn drop_connection(&mut self);
}

/// Deferred-work primitive of the host
pub trait Scheduler {
    /// Deliver `task` back to the session after `delay`
    fn run_after(&mut self, delay: Duration, task: Task);
    /// Monotonic clock
    fn now(&self) -> Instant;
}

/// Deferred work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Next step of a bank's poll loop, valid only in `epoch`
    Poll { bank: usize, epoch: u64 },
    /// Protocol timeout for the request sent with `ticket`
    ProtocolTimeout { ticket: u64 },
    /// Bounce/flash timer of a writable coil
    CoilTimer { coil: usize, generation: u64 },
    /// Periodic health status check
    StatusCheck,
}

/// Completion callback of an explicitly issued command
pub type Responder = Box<dyn FnOnce(Result<Response>) + Send>;

enum Completion {
    Poll { bank: usize, epoch: u64 },
    Coil { coil: usize },
    Command(Responder),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll { bank, epoch } => write!(f, "Poll(bank={bank}, epoch={epoch})"),
            Self::Coil { coil } => write!(f, "Coil({coil})"),
            Self::Command(_) => f.write_str("Command"),
        }
    }
}

/// Session tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub poll: PollTiming,
    pub bounce: Duration,
    pub protocol_timeout: Duration,
    pub status_interval: Duration,
    /// Log every sent/received chunk as hex
    pub show_traffic: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll: PollTiming::default(),
            bounce: DEFAULT_BOUNCE,
            protocol_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            status_interval: DEFAULT_STATUS_CHECK_INTERVAL,
            show_traffic: false,
        }
    }
}

/// Persistent transaction-id mismatch counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncErrors {
    pub count: u64,
    pub last: Option<DateTime<Local>>,
}

/// Per-connection bookkeeping; survives reconnects
#[derive(Debug, Default)]
struct ConnectionContext {
    epoch: u64,
    connected: bool,
    /// Stream declared desynchronised; set until the link is recycled
    resyncing: bool,
    last_receive: Option<Instant>,
    sync_errors: SyncErrors,
    protocol_timeouts: u64,
    frames_received: u64,
    requests_sent: u64,
}

/// Snapshot of session counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub epoch: u64,
    pub connected: bool,
    pub sync_errors: u64,
    pub last_sync_error: Option<String>,
    pub framing_overflows: u64,
    pub protocol_timeouts: u64,
    pub frames_received: u64,
    pub requests_sent: u64,
    pub queued_requests: usize,
}

/// The Modbus transaction engine bound to a transport, a scheduler and an
/// event sink
pub struct ModbusSession<T, S, E> {
    config: SessionConfig,
    codec: ModbusCodec,
    assembler: FrameAssembler,
    queue: TransactionQueue<Completion>,
    polling: PollingEngine,
    outputs: OutputController,
    signals: Vec<Signal>,
    status: StatusMonitor,
    status_signal: usize,
    sync_signal: usize,
    contact_signal: usize,
    ctx: ConnectionContext,
    transport: T,
    scheduler: S,
    sink: E,
}

impl<T, S, E> fmt::Debug for ModbusSession<T, S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusSession")
            .field("epoch", &self.ctx.epoch)
            .field("connected", &self.ctx.connected)
            .field("banks", &self.polling.len())
            .field("coils", &self.outputs.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl<T: Transport, S: Scheduler, E: EventSink> ModbusSession<T, S, E> {
    /// Build the session for `banks`, applying per-point `points` options
    /// keyed by point name (e.g. "Relay 1")
    pub fn new(
        config: SessionConfig,
        banks: &[AddressBank],
        points: &HashMap<String, PointOptions>,
        transport: T,
        scheduler: S,
        sink: E,
    ) -> Self {
        let mut signals = Vec::new();
        let mut polling = PollingEngine::new(config.poll);
        let mut outputs = OutputController::new(config.bounce);

        for bank in banks {
            let mut bank_signals = Vec::with_capacity(bank.count as usize);
            let mut bank_invert = Vec::with_capacity(bank.count as usize);

            for offset in 0..bank.count {
                let point = bank.point_name(offset);
                let options = points.get(&point).cloned().unwrap_or_default();
                let suffix = match bank.kind {
                    BankKind::Coil => "State",
                    BankKind::Register => "Value",
                };
                let invert = bank.kind == BankKind::Coil && options.invert;

                let mut signal = Signal::new(format!("{point} {suffix}"));
                if let Some(label) = options.label() {
                    signal = signal.with_mirror(format!("{label} {suffix}"));
                }
                signals.push(signal);
                let signal_index = signals.len() - 1;

                if bank.is_writable() {
                    outputs.add(
                        point,
                        options.label().map(str::to_string),
                        bank.address(offset),
                        invert,
                        signal_index,
                    );
                }
                bank_signals.push(signal_index);
                bank_invert.push(invert);
            }

            polling.add(bank.clone(), bank_signals, bank_invert);
        }

        signals.push(Signal::new(STATUS_EVENT));
        let status_signal = signals.len() - 1;
        signals.push(Signal::new(SYNC_ERRORS_EVENT));
        let sync_signal = signals.len() - 1;
        signals.push(Signal::new(LAST_CONTACT_EVENT));
        let contact_signal = signals.len() - 1;

        Self {
            codec: ModbusCodec::new(DEFAULT_UNIT_ID),
            assembler: FrameAssembler::new(),
            queue: TransactionQueue::new(),
            polling,
            outputs,
            signals,
            status: StatusMonitor::new(config.status_interval),
            status_signal,
            sync_signal,
            contact_signal,
            ctx: ConnectionContext::default(),
            config,
            transport,
            scheduler,
            sink,
        }
    }

    /// Arm the periodic status check
    pub fn start(&mut self) {
        info!(
            "Session started: {} bank(s), {} writable coil(s)",
            self.polling.len(),
            self.outputs.len()
        );
        self.scheduler
            .run_after(self.status.interval(), Task::StatusCheck);
    }

    // ------------------------------------------------------------------
    // Transport callbacks
    // ------------------------------------------------------------------

    pub fn on_connected(&mut self) {
        if self.ctx.connected {
            warn!("Connected while already connected; restarting sequence");
            self.ctx.epoch += 1;
        }
        self.ctx.connected = true;
        self.ctx.resyncing = false;
        info!("TCP connected");

        // Nothing from before the connection may rush through
        self.reset_queue();
        self.assembler.clear();

        let epoch = self.ctx.epoch;
        info!("(new sequence {})", epoch);
        self.polling.start_all(epoch);
        for bank in 0..self.polling.len() {
            self.poll_step(bank, epoch);
        }
    }

    pub fn on_disconnected(&mut self) {
        warn!("TCP disconnected");
        self.ctx.connected = false;
        self.ctx.resyncing = false;
        self.reset_queue();
        self.assembler.clear();
        // Stops every poll chain of the old connection
        self.ctx.epoch += 1;
        debug!("Epoch advanced to {}", self.ctx.epoch);
    }

    pub fn on_transport_timeout(&mut self) {
        warn!("TCP timeout (recycling TCP connection if connected)");
        self.transport.drop_connection();
    }

    pub fn on_sent(&mut self, data: &[u8]) {
        if self.config.show_traffic {
            info!("SENT: [{}]", hex(data));
        }
    }

    pub fn on_received(&mut self, data: &[u8]) {
        self.ctx.last_receive = Some(self.scheduler.now());
        if self.config.show_traffic {
            info!("RECV: [{}]", hex(data));
        }
        if self.ctx.resyncing {
            debug!("Discarding {} byte(s) from desynchronised connection", data.len());
            return;
        }

        let frames: Vec<Frame> = self.assembler.feed(data).collect();
        for frame in frames {
            if !self.dispatch(frame) {
                // Stream alignment is gone; the rest of this chunk is noise
                self.assembler.clear();
                break;
            }
        }
    }

    pub fn on_task(&mut self, task: Task) {
        match task {
            Task::Poll { bank, epoch } => self.poll_step(bank, epoch),
            Task::ProtocolTimeout { ticket } => {
                if let Some(pending) = self.queue.timeout_elapsed(ticket) {
                    warn!(
                        "MODBUS timeout (tid={:#06X}); flushing buffers and dropping TCP connection",
                        pending.transaction_id()
                    );
                    self.ctx.protocol_timeouts += 1;
                    let tid = pending.transaction_id();
                    self.fail(pending.context, ModbusError::Timeout(tid));
                    self.reset_queue();
                    self.assembler.clear();
                    self.ctx.resyncing = true;
                    self.transport.drop_connection();
                }
            },
            Task::CoilTimer { coil, generation } => {
                let plan = self.outputs.timer_fired(coil, generation);
                self.execute(plan);
            },
            Task::StatusCheck => {
                self.status_check();
                self.scheduler
                    .run_after(self.status.interval(), Task::StatusCheck);
            },
        }
    }

    // ------------------------------------------------------------------
    // Exposed operations
    // ------------------------------------------------------------------

    pub fn read_coils(&mut self, start_address: u16, count: u16, responder: Responder) {
        match self.codec.read_coils(start_address, count) {
            Ok(request) => self.submit(request, Completion::Command(responder)),
            Err(e) => responder(Err(e)),
        }
    }

    pub fn read_registers(&mut self, start_address: u16, count: u16, responder: Responder) {
        match self.codec.read_registers(start_address, count) {
            Ok(request) => self.submit(request, Completion::Command(responder)),
            Err(e) => responder(Err(e)),
        }
    }

    pub fn write_coil(&mut self, address: u16, state: bool, responder: Responder) {
        let request = self.codec.write_coil(address, state);
        self.submit(request, Completion::Command(responder));
    }

    /// Run a momentary/state action on a writable coil by name or label
    pub fn coil_action(&mut self, name: &str, action: CoilAction) -> Result<()> {
        let coil = self
            .outputs
            .find(name)
            .ok_or_else(|| ModbusError::UnknownCoil(name.to_string()))?;
        self.coil_action_at(coil, action)
    }

    pub fn coil_action_at(&mut self, coil: usize, action: CoilAction) -> Result<()> {
        if self.outputs.get(coil).is_none() {
            return Err(ModbusError::UnknownCoil(format!("#{coil}")));
        }
        if !self.ctx.connected && action != CoilAction::Flash(false) {
            return Err(ModbusError::NotConnected);
        }
        debug!("Coil #{} action: {}", coil, action);
        let plan = self.outputs.apply(coil, action);
        self.execute(plan);
        Ok(())
    }

    /// Stop all coil timers
    pub fn shutdown(&mut self) {
        self.outputs.stop_all();
        for completion in self.queue.clear() {
            self.fail(completion, ModbusError::ConnectionLost);
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            epoch: self.ctx.epoch,
            connected: self.ctx.connected,
            sync_errors: self.ctx.sync_errors.count,
            last_sync_error: self.ctx.sync_errors.last.map(|t| t.to_rfc3339()),
            framing_overflows: self.assembler.overflows(),
            protocol_timeouts: self.ctx.protocol_timeouts,
            frames_received: self.ctx.frames_received,
            requests_sent: self.ctx.requests_sent,
            queued_requests: self.queue.len(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.ctx.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.connected
    }

    /// True between a desync (mismatch or protocol timeout) and the
    /// connection being recycled
    pub fn is_resyncing(&self) -> bool {
        self.ctx.resyncing
    }

    pub fn sync_errors(&self) -> &SyncErrors {
        &self.ctx.sync_errors
    }

    pub fn polling(&self) -> &PollingEngine {
        &self.polling
    }

    pub fn outputs(&self) -> &OutputController {
        &self.outputs
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Names of every event this session can publish
    pub fn event_names(&self) -> Vec<String> {
        self.signals
            .iter()
            .flat_map(|signal| {
                std::iter::once(signal.name().to_string()).chain(signal.mirrors().iter().cloned())
            })
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut E {
        &mut self.sink
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn poll_step(&mut self, bank: usize, epoch: u64) {
        if !self.polling.admit(bank, epoch, self.ctx.epoch) {
            return;
        }
        match self.polling.request(bank, &mut self.codec) {
            Ok(request) => self.submit(request, Completion::Poll { bank, epoch }),
            Err(e) => warn!("Bank {} request rejected: {}", bank, e),
        }
    }

    fn submit(&mut self, request: Request, completion: Completion) {
        if !self.ctx.connected {
            debug!(
                "{} tid={:#06X} dropped: not connected",
                request.function, request.transaction_id
            );
            self.fail(completion, ModbusError::NotConnected);
            return;
        }
        if self.ctx.resyncing {
            self.fail(completion, ModbusError::ConnectionLost);
            return;
        }
        self.queue.enqueue(request, completion);
        self.pump();
    }

    /// Put the next waiting request on the wire if the slot is free
    fn pump(&mut self) {
        if let Some((request, ticket)) = self.queue.start_next() {
            debug!(
                "Send {} tid={:#06X} addr={} value={}",
                request.function, request.transaction_id, request.address, request.value
            );
            self.transport.send(request.encode());
            self.ctx.requests_sent += 1;
            self.scheduler
                .run_after(self.config.protocol_timeout, Task::ProtocolTimeout { ticket });
        }
    }

    /// Returns false when the stream is desynchronised
    fn dispatch(&mut self, frame: Frame) -> bool {
        self.ctx.frames_received += 1;
        match self.queue.dispatch(frame) {
            Dispatch::Matched(pending, frame) => {
                let result = codec::decode(&frame, pending.function(), pending.expected_count());
                self.complete(pending.context, result);
                self.pump();
                true
            },
            Dispatch::Mismatch { expected, received } => {
                self.sync_error(received, Some(expected));
                false
            },
            Dispatch::Unsolicited { received } => {
                self.sync_error(received, None);
                false
            },
        }
    }

    fn complete(&mut self, completion: Completion, result: Result<Response>) {
        match completion {
            Completion::Poll { bank, epoch } => {
                if !self.polling.admit(bank, epoch, self.ctx.epoch) {
                    return;
                }
                match result {
                    Ok(response) => {
                        let changed = self.polling.apply(
                            bank,
                            &response,
                            &mut self.signals,
                            &mut self.sink,
                        );
                        if changed > 0 {
                            debug!("Bank {}: {} change(s)", bank, changed);
                        }
                    },
                    Err(e) => warn!("Bank {} poll failed: {}", bank, e),
                }
                self.polling.scheduled(bank);
                self.scheduler
                    .run_after(self.polling.gap(bank), Task::Poll { bank, epoch });
            },
            Completion::Coil { coil } => match result {
                Ok(Response::CoilWritten(state)) => {
                    if let Some(display) = self.outputs.confirm(coil, state) {
                        if let Some(signal) = self
                            .outputs
                            .get(coil)
                            .and_then(|output| self.signals.get_mut(output.signal))
                        {
                            signal.emit(SignalValue::Bool(display), &mut self.sink);
                        }
                    }
                },
                Ok(other) => warn!("Coil #{} write: unexpected response {:?}", coil, other),
                Err(e) => warn!("Coil #{} write failed: {}", coil, e),
            },
            Completion::Command(responder) => responder(result),
        }
    }

    fn fail(&mut self, completion: Completion, error: ModbusError) {
        match completion {
            // The loop ends here; the next connect starts a new one
            Completion::Poll { bank, epoch } => {
                debug!("Bank {} loop (epoch {}) ended: {}", bank, epoch, error)
            },
            Completion::Coil { coil } => warn!("Coil #{} write failed: {}", coil, error),
            Completion::Command(responder) => responder(Err(error)),
        }
    }

    fn reset_queue(&mut self) {
        for completion in self.queue.clear() {
            self.fail(completion, ModbusError::ConnectionLost);
        }
    }

    fn execute(&mut self, plan: ActionPlan) {
        if let Some(write) = plan.write {
            let request = self.codec.write_coil(write.address, write.state);
            self.submit(request, Completion::Coil { coil: write.coil });
        }
        if let Some(arm) = plan.arm {
            self.scheduler.run_after(
                arm.delay,
                Task::CoilTimer {
                    coil: arm.coil,
                    generation: arm.generation,
                },
            );
        }
    }

    fn sync_error(&mut self, received: u16, expected: Option<u16>) {
        match expected {
            Some(expected) => warn!(
                "Mismatched TID (modbus seqnum) detected; dropping connection and resyncing... tid={}, expected={}",
                received, expected
            ),
            None => warn!(
                "Response tid={} with no request pending; dropping connection and resyncing...",
                received
            ),
        }

        let now = Local::now();
        self.ctx.sync_errors.count += 1;
        self.ctx.sync_errors.last = Some(now);
        let value = SignalValue::SyncErrors {
            count: self.ctx.sync_errors.count,
            last: now.to_rfc3339(),
        };
        self.signals[self.sync_signal].emit(value, &mut self.sink);

        self.ctx.resyncing = true;
        self.transport.drop_connection();
    }

    fn status_check(&mut self) {
        let now = self.scheduler.now();
        let since = self
            .ctx
            .last_receive
            .map(|at| now.saturating_duration_since(at));

        let report = self.status.check(since, Local::now());
        if let HealthReport::Ok { contact } = &report {
            self.signals[self.contact_signal]
                .emit(SignalValue::Text(contact.to_rfc3339()), &mut self.sink);
        } else {
            debug!("Status check: {}", report.message());
        }
        let value = SignalValue::Status {
            level: report.level(),
            message: report.message().to_string(),
        };
        self.signals[self.status_signal].emit(value, &mut self.sink);
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::constants::{COIL_OFF, COIL_ON};
    use crate::profile::{DeviceProfile, KnownDevice};
    use crate::testing::{
        coils_response, exception_response, registers_response, run_for, write_coil_response,
        ManualScheduler, RecordingSink, RecordingTransport, TestSession,
    };
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;

    fn session_with(banks: &[AddressBank], points: &HashMap<String, PointOptions>) -> TestSession {
        ModbusSession::new(
            SessionConfig::default(),
            banks,
            points,
            RecordingTransport::default(),
            ManualScheduler::new(),
            RecordingSink::default(),
        )
    }

    fn adam_6060() -> TestSession {
        let banks = DeviceProfile::Known(KnownDevice::Adam6060).resolve().unwrap();
        session_with(&banks, &HashMap::new())
    }

    /// One relay whose poll gap stays out of the way of timer tests
    fn single_relay(points: &HashMap<String, PointOptions>) -> TestSession {
        let config = SessionConfig {
            poll: PollTiming {
                read_only: Duration::from_millis(80),
                writable: Duration::from_secs(60),
            },
            ..SessionConfig::default()
        };
        ModbusSession::new(
            config,
            &[AddressBank::coils(16, 1, "Relay", false)],
            points,
            RecordingTransport::default(),
            ManualScheduler::new(),
            RecordingSink::default(),
        )
    }

    fn last_tid(session: &TestSession) -> u16 {
        session.transport().last_request().unwrap().transaction_id
    }

    fn collector() -> (Arc<Mutex<Vec<Result<Response>>>>, impl Fn() -> Responder) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let shared = results.clone();
        let make = move || -> Responder {
            let shared = shared.clone();
            Box::new(move |result| shared.lock().unwrap().push(result))
        };
        (results, make)
    }

    #[test]
    fn test_connect_polls_banks_one_at_a_time() {
        let mut session = adam_6060();
        session.on_connected();

        assert_eq!(session.transport().sent.len(), 1);
        let first = session.transport().last_request().unwrap();
        assert_eq!(first.function, 0x01);
        assert_eq!(first.address, 0);
        assert_eq!(first.value, 6);
        assert_eq!(session.queue_len(), 2);

        let reply = coils_response(first.transaction_id, 1, &[false; 6]);
        session.on_received(&reply);

        assert_eq!(session.transport().sent.len(), 2);
        let second = session.transport().last_request().unwrap();
        assert_eq!(second.address, 16);
        assert_ne!(second.transaction_id, first.transaction_id);
    }

    #[test]
    fn test_requests_use_unit_one() {
        let mut session = adam_6060();
        session.on_connected();
        let (_, responder) = collector();
        session.write_coil(17, true, responder());
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 6]));

        let requests = session.transport().requests();
        assert!(requests.len() >= 2);
        assert!(requests.iter().all(|request| request.unit_id == DEFAULT_UNIT_ID));
    }

    #[test]
    fn test_single_request_in_flight() {
        let mut session = adam_6060();
        session.on_connected();
        let (_, responder) = collector();
        for _ in 0..5 {
            session.read_registers(0, 2, responder());
        }
        assert_eq!(session.transport().sent.len(), 1);
        assert_eq!(session.queue_len(), 7);
    }

    #[test]
    fn test_poll_emits_changes_only() {
        let mut session = adam_6060();
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[true, false, true, false, false, false]));

        let sink = session.sink();
        assert_eq!(sink.count("Input 1 State"), 1);
        assert_eq!(sink.last("Input 1 State"), Some(&SignalValue::Bool(true)));
        assert_eq!(sink.last("Input 2 State"), Some(&SignalValue::Bool(false)));

        // Answer the relay bank, then let the input bank poll again
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 6]));
        run_for(&mut session, Duration::from_millis(80));
        let tid = last_tid(&session);
        session.sink_mut().clear();
        session.on_received(&coils_response(tid, 1, &[true, true, true, false, false, false]));

        let sink = session.sink();
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.last("Input 2 State"), Some(&SignalValue::Bool(true)));
    }

    #[test]
    fn test_poll_gap_per_bank() {
        let banks = [
            AddressBank::coils(0, 2, "Input", true),
            AddressBank::coils(16, 2, "Relay", false),
        ];
        let mut session = session_with(&banks, &HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 2]));
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 2]));

        let epoch = session.epoch();
        let pending = session.scheduler().pending();
        assert!(pending.contains(&(Duration::from_millis(80), Task::Poll { bank: 0, epoch })));
        assert!(pending.contains(&(Duration::from_millis(2000), Task::Poll { bank: 1, epoch })));
    }

    #[test]
    fn test_disconnect_stops_stale_loops() {
        let mut session = session_with(&[AddressBank::coils(0, 4, "Input", true)], &HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 4]));
        assert_eq!(session.transport().sent.len(), 1);

        session.on_disconnected();
        run_for(&mut session, Duration::from_secs(3));

        assert_eq!(session.transport().sent.len(), 1);
        assert_eq!(session.polling().state(0), Some(crate::polling::PollState::Aborted));
    }

    #[test]
    fn test_reconnect_starts_new_sequence() {
        let mut session = session_with(&[AddressBank::coils(0, 4, "Input", true)], &HashMap::new());
        session.on_connected();
        session.on_disconnected();
        session.on_connected();

        assert_eq!(session.epoch(), 1);
        assert_eq!(session.transport().sent.len(), 2);
        assert_eq!(session.polling().banks()[0].epoch(), 1);
        assert_eq!(session.queue_len(), 1);
    }

    #[test]
    fn test_disconnect_fails_queued_commands() {
        let mut session = adam_6060();
        session.on_connected();
        let (results, responder) = collector();
        session.write_coil(16, true, responder());
        session.on_disconnected();

        let results = results.lock().unwrap();
        assert_eq!(results.as_slice(), &[Err(ModbusError::ConnectionLost)]);
    }

    #[test]
    fn test_commands_rejected_while_disconnected() {
        let mut session = adam_6060();
        let (results, responder) = collector();
        session.read_coils(0, 6, responder());

        assert!(session.transport().sent.is_empty());
        assert_eq!(results.lock().unwrap()[0], Err(ModbusError::NotConnected));
        assert_eq!(
            session.coil_action("Relay 1", CoilAction::Close),
            Err(ModbusError::NotConnected)
        );
    }

    #[test]
    fn test_mismatch_counts_and_drops() {
        let mut session = adam_6060();
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid.wrapping_add(40), 1, &[false; 6]));

        assert_eq!(session.sync_errors().count, 1);
        assert!(session.sync_errors().last.is_some());
        assert_eq!(session.transport().drops, 1);
        assert_eq!(session.sink().count(SYNC_ERRORS_EVENT), 1);
        // The unanswered request is still pending
        assert_eq!(session.queue_len(), 2);
        assert!(matches!(
            session.sink().last(SYNC_ERRORS_EVENT),
            Some(SignalValue::SyncErrors { count: 1, .. })
        ));
    }

    #[test]
    fn test_mismatch_discards_rest_of_chunk() {
        let mut session = adam_6060();
        session.on_connected();
        let tid = last_tid(&session);
        let mut chunk = coils_response(tid.wrapping_add(1), 1, &[false; 6]).to_vec();
        chunk.extend_from_slice(&coils_response(tid, 1, &[false; 6]));
        session.on_received(&chunk);

        assert_eq!(session.sync_errors().count, 1);
        assert_eq!(session.sink().count("Input 1 State"), 0);
    }

    #[test]
    fn test_desynchronised_stream_is_not_trusted() {
        let mut session = adam_6060();
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid.wrapping_add(1), 1, &[false; 6]));
        assert!(session.is_resyncing());

        // A chunk that was already in flight carries the expected reply
        session.on_received(&coils_response(tid, 1, &[true; 6]));
        assert_eq!(session.sync_errors().count, 1);
        assert_eq!(session.transport().drops, 1);
        assert_eq!(session.sink().count("Input 1 State"), 0);

        let (results, responder) = collector();
        session.read_registers(0, 1, responder());
        assert_eq!(results.lock().unwrap()[0], Err(ModbusError::ConnectionLost));
        assert_eq!(session.transport().sent.len(), 1);

        session.on_disconnected();
        session.on_connected();
        assert!(!session.is_resyncing());
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[true; 6]));
        assert_eq!(session.sink().last("Input 1 State"), Some(&SignalValue::Bool(true)));
    }

    #[test]
    fn test_late_reply_after_timeout_is_discarded() {
        let mut session = session_with(&[AddressBank::coils(0, 4, "Input", true)], &HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        run_for(&mut session, Duration::from_secs(5));
        assert_eq!(session.transport().drops, 1);
        assert!(session.is_resyncing());

        session.on_received(&coils_response(tid, 1, &[true; 4]));
        assert_eq!(session.transport().drops, 1);
        assert_eq!(session.sync_errors().count, 0);
        assert_eq!(session.sink().count("Input 1 State"), 0);
    }

    #[test]
    fn test_unsolicited_frame_is_sync_error() {
        let mut session = session_with(&[], &HashMap::new());
        session.on_connected();
        session.on_received(&coils_response(7, 1, &[true]));

        assert_eq!(session.sync_errors().count, 1);
        assert_eq!(session.transport().drops, 1);
    }

    #[test]
    fn test_protocol_timeout_flushes_everything() {
        let mut session = adam_6060();
        session.on_connected();
        let (results, responder) = collector();
        session.read_coils(0, 6, responder());
        session.on_received(&[0x00]);

        run_for(&mut session, Duration::from_secs(5));

        assert_eq!(session.transport().drops, 1);
        assert_eq!(session.queue_len(), 0);
        assert_eq!(session.stats().protocol_timeouts, 1);
        assert_eq!(results.lock().unwrap().as_slice(), &[Err(ModbusError::ConnectionLost)]);
    }

    #[test]
    fn test_answered_request_timeout_is_ignored() {
        let mut session = session_with(&[AddressBank::coils(0, 4, "Input", true)], &HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 4]));

        run_for(&mut session, Duration::from_secs(5));
        assert_eq!(session.transport().drops, 0);
    }

    #[test]
    fn test_command_timeout_reports_transaction() {
        let mut session = session_with(&[], &HashMap::new());
        session.on_connected();
        let (results, responder) = collector();
        session.read_registers(0, 1, responder());
        let tid = last_tid(&session);

        run_for(&mut session, Duration::from_secs(5));
        assert_eq!(results.lock().unwrap().as_slice(), &[Err(ModbusError::Timeout(tid))]);
    }

    #[test]
    fn test_read_registers_command() {
        let mut session = session_with(&[], &HashMap::new());
        session.on_connected();
        let (results, responder) = collector();
        session.read_registers(40, 2, responder());
        let request = session.transport().last_request().unwrap();
        assert_eq!((request.function, request.address, request.value), (0x03, 40, 2));

        session.on_received(&registers_response(request.transaction_id, 1, &[0x1234, 7]));
        assert_eq!(
            results.lock().unwrap().as_slice(),
            &[Ok(Response::Registers(vec![0x1234, 7]))]
        );
    }

    #[test]
    fn test_invalid_command_not_sent() {
        let mut session = session_with(&[], &HashMap::new());
        session.on_connected();
        let (results, responder) = collector();
        session.read_coils(0, 0, responder());
        assert!(session.transport().sent.is_empty());
        assert!(matches!(results.lock().unwrap()[0], Err(ModbusError::InvalidRequest(_))));
    }

    #[test]
    fn test_register_bank_values() {
        let mut session = session_with(&[AddressBank::registers(0, 2, "AI")], &HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&registers_response(tid, 1, &[500, 501]));
        assert_eq!(session.sink().last("AI 2 Value"), Some(&SignalValue::Integer(501)));
    }

    #[test]
    fn test_decode_failure_keeps_polling() {
        let mut session = session_with(&[AddressBank::coils(0, 4, "Input", true)], &HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&exception_response(tid, 1, 0x01, 0x02));

        assert!(session
            .scheduler()
            .has_pending(Task::Poll { bank: 0, epoch: 0 }));
        run_for(&mut session, Duration::from_millis(80));
        assert_eq!(session.transport().sent.len(), 2);
    }

    #[test]
    fn test_bounce_closes_then_opens() {
        let mut session = single_relay(&HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false]));

        session.coil_action("relay 1", CoilAction::Bounce).unwrap();
        let write = session.transport().last_request().unwrap();
        assert_eq!((write.function, write.address, write.value), (0x05, 16, COIL_ON));
        session.on_received(&write_coil_response(write.transaction_id, 1, 16, true));
        assert_eq!(session.sink().last("Relay 1 State"), Some(&SignalValue::Bool(true)));

        run_for(&mut session, Duration::from_millis(1199));
        assert_eq!(session.transport().sent.len(), 2);
        run_for(&mut session, Duration::from_millis(1));
        let revert = session.transport().last_request().unwrap();
        assert_eq!((revert.function, revert.value), (0x05, COIL_OFF));
    }

    #[test]
    fn test_bounce_retriggers() {
        let mut session = single_relay(&HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false]));

        session.coil_action("Relay 1", CoilAction::Bounce).unwrap();
        let tid = last_tid(&session);
        session.on_received(&write_coil_response(tid, 1, 16, true));
        run_for(&mut session, Duration::from_millis(600));
        session.coil_action("Relay 1", CoilAction::Bounce).unwrap();
        let tid = last_tid(&session);
        session.on_received(&write_coil_response(tid, 1, 16, true));

        // The first arm would have fired at 1200ms
        run_for(&mut session, Duration::from_millis(1000));
        assert_eq!(session.transport().last_request().unwrap().value, COIL_ON);
        run_for(&mut session, Duration::from_millis(200));
        assert_eq!(session.transport().last_request().unwrap().value, COIL_OFF);
    }

    #[test]
    fn test_flash_toggles_until_stopped() {
        let mut session = single_relay(&HashMap::new());
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false]));

        session.coil_action("Relay 1", CoilAction::Flash(true)).unwrap();
        let mut values = Vec::new();
        for _ in 0..3 {
            let write = session.transport().last_request().unwrap();
            values.push(write.value);
            let on = write.value == COIL_ON;
            session.on_received(&write_coil_response(write.transaction_id, 1, 16, on));
            run_for(&mut session, Duration::from_millis(1200));
        }
        assert_eq!(values, vec![COIL_ON, COIL_OFF, COIL_ON]);

        let tid = last_tid(&session);
        session.on_received(&write_coil_response(tid, 1, 16, false));
        session.coil_action("Relay 1", CoilAction::Flash(false)).unwrap();
        let writes_before = session
            .transport()
            .requests()
            .iter()
            .filter(|request| request.function == 0x05)
            .count();
        run_for(&mut session, Duration::from_millis(1000));
        let writes_after = session
            .transport()
            .requests()
            .iter()
            .filter(|request| request.function == 0x05)
            .count();
        assert_eq!(writes_before, writes_after);
    }

    #[test]
    fn test_label_mirror_and_invert() {
        let mut points = HashMap::new();
        points.insert(
            "Relay 1".to_string(),
            PointOptions {
                invert: true,
                label: Some("Door".to_string()),
            },
        );
        let mut session = single_relay(&points);
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false]));

        assert_eq!(session.sink().last("Relay 1 State"), Some(&SignalValue::Bool(true)));
        assert_eq!(session.sink().last("Door State"), Some(&SignalValue::Bool(true)));

        session.coil_action("door", CoilAction::Close).unwrap();
        let tid = last_tid(&session);
        session.on_received(&write_coil_response(tid, 1, 16, true));
        assert_eq!(session.sink().last("Door State"), Some(&SignalValue::Bool(false)));
    }

    #[test]
    fn test_unknown_coil() {
        let mut session = adam_6060();
        session.on_connected();
        assert_eq!(
            session.coil_action("Input 1", CoilAction::Close),
            Err(ModbusError::UnknownCoil("Input 1".to_string()))
        );
    }

    #[test]
    fn test_status_check_missing_then_ok() {
        let mut session = session_with(&[], &HashMap::new());
        session.start();
        run_for(&mut session, Duration::from_secs(75));
        assert_eq!(
            session.sink().last(STATUS_EVENT),
            Some(&SignalValue::Status {
                level: 2,
                message: "Always been missing.".to_string()
            })
        );

        session.on_connected();
        session.on_received(&[0x00, 0x01]);
        run_for(&mut session, Duration::from_secs(75));
        assert_eq!(
            session.sink().last(STATUS_EVENT),
            Some(&SignalValue::Status {
                level: 0,
                message: "OK".to_string()
            })
        );
        assert_eq!(session.sink().count(LAST_CONTACT_EVENT), 1);
    }

    #[test]
    fn test_event_names() {
        let mut points = HashMap::new();
        points.insert(
            "Relay 1".to_string(),
            PointOptions {
                invert: false,
                label: Some("Pump".to_string()),
            },
        );
        let session = single_relay(&points);
        let names = session.event_names();
        assert!(names.contains(&"Relay 1 State".to_string()));
        assert!(names.contains(&"Pump State".to_string()));
        assert!(names.contains(&STATUS_EVENT.to_string()));
        assert!(names.contains(&SYNC_ERRORS_EVENT.to_string()));
    }

    #[test]
    #[traced_test]
    fn test_show_traffic_logs_hex() {
        let config = SessionConfig {
            show_traffic: true,
            ..SessionConfig::default()
        };
        let mut session: TestSession = ModbusSession::new(
            config,
            &[],
            &HashMap::new(),
            RecordingTransport::default(),
            ManualScheduler::new(),
            RecordingSink::default(),
        );
        session.on_sent(&[0x00, 0x01, 0xAB]);
        session.on_received(&[0xFF]);
        assert!(logs_contain("SENT: [0001ab]"));
        assert!(logs_contain("RECV: [ff]"));
    }

    #[test]
    fn test_stats_snapshot() {
        let mut session = adam_6060();
        session.on_connected();
        let tid = last_tid(&session);
        session.on_received(&coils_response(tid, 1, &[false; 6]));

        let stats = session.stats();
        assert!(stats.connected);
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.queued_requests, 1);
        assert_eq!(stats.sync_errors, 0);
    }
}
