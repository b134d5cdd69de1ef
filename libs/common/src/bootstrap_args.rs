//! Common command-line arguments for the relay services
//!
//! Services flatten [`ServiceArgs`] into their own parser.

#[cfg(feature = "cli")]
use clap::Args;
use std::path::PathBuf;

/// Common service startup arguments
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct ServiceArgs {
    /// Configuration file (YAML or TOML)
    #[cfg_attr(feature = "cli", arg(short = 'c', long, env = "CONFIG_PATH", global = true))]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error or a filter spec)
    #[cfg_attr(feature = "cli", arg(short = 'l', long, global = true))]
    pub log_level: Option<String>,

    /// Disable colored output (useful for log files)
    #[cfg_attr(feature = "cli", arg(long, global = true))]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[cfg_attr(feature = "cli", arg(long))]
    pub validate: bool,
}

impl ServiceArgs {
    /// The override if given, else `configured`
    pub fn effective_log_level(&self, configured: &str) -> String {
        self.log_level
            .as_deref()
            .map(str::trim)
            .filter(|level| !level.is_empty())
            .unwrap_or(configured)
            .to_string()
    }
}
