//! Modbus-TCP client engine for relay and digital-input modules
//!
//! A sans-IO transaction engine: the host owns the socket and the timers and
//! feeds events in; the engine hands bytes, deferred tasks and published
//! events back out through three collaborator traits.
//!
//! # Modules
//!
//! - `frame` - MBAP frame reassembly from a byte stream
//! - `queue` - single in-flight request FIFO with transaction id matching
//! - `codec` - request encoding and response decoding
//! - `polling` - self-rescheduling per-bank poll loops guarded by epochs
//! - `output` - writable coil actions (state, bounce, flash)
//! - `session` - everything above bound to `Transport`/`Scheduler`/`EventSink`
//!
//! # Example
//!
//! ```ignore
//! let banks = DeviceProfile::Known(KnownDevice::Adam6060).resolve()?;
//! let mut session = ModbusSession::new(config, &banks, &points, transport, scheduler, sink);
//! session.start();
//! session.on_connected();
//! session.on_received(&bytes_from_socket);
//! ```

pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod output;
pub mod polling;
pub mod profile;
pub mod queue;
pub mod session;
pub mod signal;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::{FunctionCode, ModbusCodec, Request, Response};
pub use error::{ModbusError, Result};
pub use frame::{Frame, FrameAssembler};
pub use output::{CoilAction, OutputController};
pub use polling::{PollState, PollTiming, PollingEngine};
pub use profile::{AddressBank, BankKind, DeviceProfile, KnownDevice, PointOptions};
pub use queue::TransactionQueue;
pub use session::{
    ModbusSession, Responder, Scheduler, SessionConfig, SessionStats, Task, Transport,
    LAST_CONTACT_EVENT, STATUS_EVENT, SYNC_ERRORS_EVENT,
};
pub use signal::{EventSink, Signal, SignalValue};
pub use status::{HealthReport, StatusMonitor};
