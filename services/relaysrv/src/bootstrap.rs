//! Service bootstrap: command line and logging

use clap::{Parser, Subcommand};

use common::logging::LogConfig;
use relay_modbus::CoilAction;

use crate::config::{ConfigOverrides, RelayConfig};

// Re-export common bootstrap functionality
pub use common::bootstrap_args::ServiceArgs;

/// Service name used for logging and log file names
pub const SERVICE_NAME: &str = "relaysrv";

/// Command-line arguments for relaysrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "relaysrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus-TCP relay/DI module service",
    long_about = None
)]
pub struct Args {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// Device host override
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Device port override
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the service (default)
    Run,
    /// Read coils once and print them
    ReadCoils {
        #[arg(long, default_value_t = 0)]
        start: u16,
        #[arg(long)]
        count: u16,
    },
    /// Read holding registers once and print them
    ReadRegisters {
        #[arg(long, default_value_t = 0)]
        start: u16,
        #[arg(long)]
        count: u16,
    },
    /// Write a single coil
    WriteCoil {
        #[arg(long)]
        address: u16,
        #[arg(long, action = clap::ArgAction::Set)]
        state: bool,
    },
    /// Run an action on a named coil: on, off, open, close, bounce, flash-on, flash-off
    Coil { name: String, action: CoilAction },
    /// Print session statistics as JSON
    Stats,
    /// Print the resolved configuration as YAML
    Config,
}

impl Args {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            log_level: self.service.log_level.clone(),
        }
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// Initialize logging from the resolved configuration
pub fn initialize_logging(
    args: &Args,
    config: &RelayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (level, log_dir) = match args.command() {
        Command::Run => (
            args.service.effective_log_level(&config.logging.level),
            config.logging.dir.clone(),
        ),
        // One-shot commands keep stdout for their output
        _ => (args.service.effective_log_level("warn"), None),
    };

    common::logging::init_with_config(LogConfig {
        service_name: SERVICE_NAME.to_string(),
        level,
        log_dir,
        enable_json: config.logging.json,
        ansi: !args.service.no_color,
    })
}
