//! Basic library shared by the relay services
//!
//! Provides:
//! - logging initialisation (console and daily-rolling file)
//! - hex formatting for traffic dumps
//! - graceful shutdown signal handling
//! - common command-line arguments

pub mod bootstrap_args;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;

// Re-export CLI dependencies when cli feature is enabled
#[cfg(feature = "cli")]
pub use clap;
