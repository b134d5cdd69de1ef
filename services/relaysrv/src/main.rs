//! Relay Service (`relaysrv`)
//!
//! Polls a Modbus-TCP relay/DI module and drives its outputs.

use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relay_modbus::CoilAction;
use relaysrv::bootstrap::{self, Args, Command};
use relaysrv::{cli, RelayConfig, RelayService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RelayConfig::load(args.service.config.as_deref(), &args.overrides())
        .context("Failed to load configuration")?;

    bootstrap::initialize_logging(&args, &config)
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
    config.log_warnings();

    if args.service.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    match args.command() {
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        },
        Command::Run => run(&config).await,
        command => run_once(&config, command).await,
    }
}

async fn run(config: &RelayConfig) -> anyhow::Result<()> {
    info!("Starting {} v{}", bootstrap::SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    config.log_summary();

    let token = CancellationToken::new();
    let service = RelayService::start(config, token.clone())?;
    let watcher = common::shutdown::cancel_on_shutdown(token.clone());

    token.cancelled().await;
    service.join().await;
    let _ = watcher.await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_once(config: &RelayConfig, command: Command) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let service = RelayService::start(config, token.clone())?;
    let handle = service.handle();

    let connect = Duration::from_millis(config.timing.connect_timeout_ms);
    let result = cli::execute(&handle, &command, connect).await;

    // A bounce reverts on the engine's timer; keep the service up until it has
    if result.is_ok() && matches!(command, Command::Coil { action: CoilAction::Bounce, .. }) {
        let bounce = Duration::from_millis(config.timing.bounce_ms);
        tokio::time::sleep(bounce + Duration::from_millis(500)).await;
    }

    handle.shutdown();
    service.join().await;

    match result {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        },
        Err(e) => {
            error!("{:?} failed: {}", command, e);
            Err(e.into())
        },
    }
}
