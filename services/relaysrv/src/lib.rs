//! Relay service (`relaysrv`)
//!
//! Hosts the `relay-modbus` engine on tokio: TCP link with reconnect, timer
//! scheduling, event fan-out and a clonable [`ServiceHandle`] API.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod link;
pub mod runtime;

pub use config::{ConfigOverrides, RelayConfig};
pub use error::{RelaySrvError, Result};
pub use runtime::{PublishedEvent, RelayService, ServiceHandle};
