//! One-shot command execution against a running service

use std::time::Duration;

use crate::bootstrap::Command;
use crate::error::Result;
use crate::runtime::ServiceHandle;

/// Run `command` once the link is up and return the lines to print
pub async fn execute(
    handle: &ServiceHandle,
    command: &Command,
    connect: Duration,
) -> Result<Vec<String>> {
    handle.wait_connected(connect).await?;

    let lines = match command {
        Command::ReadCoils { start, count } => handle
            .read_coils(*start, *count)
            .await?
            .iter()
            .enumerate()
            .map(|(i, state)| format_coil(*start as usize + i, *state))
            .collect(),
        Command::ReadRegisters { start, count } => handle
            .read_registers(*start, *count)
            .await?
            .iter()
            .enumerate()
            .map(|(i, value)| {
                format!("{:>5}: {} (0x{:04X})", *start as usize + i, value, value)
            })
            .collect(),
        Command::WriteCoil { address, state } => {
            let confirmed = handle.write_coil(*address, *state).await?;
            vec![format_coil(*address as usize, confirmed)]
        },
        Command::Coil { name, action } => {
            handle.coil_action(name, *action).await?;
            vec![format!("{}: {}", name, action)]
        },
        Command::Stats => vec![serde_json::to_string_pretty(&handle.stats().await?)?],
        Command::Run | Command::Config => Vec::new(),
    };
    Ok(lines)
}

fn format_coil(address: usize, state: bool) -> String {
    format!("{:>5}: {}", address, if state { "ON" } else { "OFF" })
}
