//! Observable values published to the host
//!
//! Every coil, register and status value the engine exposes is a [`Signal`].
//! Poll results go through [`Signal::emit_if_changed`] so a steady device
//! produces no event traffic; confirmations and status reports use
//! [`Signal::emit`]. A signal may carry mirror names (the user-supplied
//! labels) under which each emission is republished.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value carried by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Integer(u16),
    Status { level: u8, message: String },
    SyncErrors { count: u64, last: String },
    Text(String),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Status { level, message } => write!(f, "level {level}: {message}"),
            Self::SyncErrors { count, last } => write!(f, "{count} (last {last})"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Host-side receiver of published events
pub trait EventSink {
    fn publish(&mut self, event: &str, value: &SignalValue);
}

/// A named observable value
#[derive(Debug, Clone)]
pub struct Signal {
    name: String,
    last: Option<SignalValue>,
    mirrors: Vec<String>,
}

impl Signal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last: None,
            mirrors: Vec::new(),
        }
    }

    /// Also publish every emission under `name`
    pub fn with_mirror(mut self, name: impl Into<String>) -> Self {
        self.mirrors.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    pub fn last(&self) -> Option<&SignalValue> {
        self.last.as_ref()
    }

    /// Publish unconditionally
    pub fn emit(&mut self, value: SignalValue, sink: &mut dyn EventSink) {
        sink.publish(&self.name, &value);
        for mirror in &self.mirrors {
            sink.publish(mirror, &value);
        }
        self.last = Some(value);
    }

    /// Publish only when `value` differs from the last emission. Returns
    /// whether anything was published.
    pub fn emit_if_changed(&mut self, value: SignalValue, sink: &mut dyn EventSink) -> bool {
        if self.last.as_ref() == Some(&value) {
            return false;
        }
        self.emit(value, sink);
        true
    }
}
