//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML/TOML file, then
//! `RELAYSRV_` environment variables (nested keys split on `__`, e.g.
//! `RELAYSRV_DEVICE__HOST`), then command-line overrides.

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use relay_modbus::constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MODBUS_TCP_PORT};
use relay_modbus::{
    AddressBank, DeviceProfile, KnownDevice, PointOptions, PollTiming, SessionConfig,
};

use crate::error::{RelaySrvError, Result};
use crate::link::LinkConfig;

/// Used when no `--config` is given and the file exists
pub const DEFAULT_CONFIG_PATH: &str = "config/relaysrv.yaml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "RELAYSRV_";

/// Profile name selecting user-supplied banks
pub const CUSTOM_PROFILE: &str = "custom";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub device: DeviceConfig,
    /// Per-point options keyed by point name ("Relay 1")
    pub points: BTreeMap<String, PointOptions>,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

/// Device connection and address map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    /// `adam-6050`, `adam-6060` or `custom`
    pub profile: String,
    pub coil_banks: Vec<BankConfig>,
    pub register_banks: Vec<BankConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: MODBUS_TCP_PORT,
            profile: "adam-6060".to_string(),
            coil_banks: Vec::new(),
            register_banks: Vec::new(),
        }
    }
}

/// One bank of a custom profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankConfig {
    pub start_address: u16,
    pub count: u16,
    pub prefix: String,
    /// Ignored for register banks
    #[serde(default)]
    pub read_only: bool,
}

/// Timers, in milliseconds unless noted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub bounce_ms: u64,
    pub read_only_poll_ms: u64,
    pub writable_poll_ms: u64,
    pub protocol_timeout_ms: u64,
    pub transport_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub status_check_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bounce_ms: 1200,
            read_only_poll_ms: 80,
            writable_poll_ms: 2000,
            protocol_timeout_ms: 5000,
            transport_timeout_ms: 45_000,
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 2000,
            status_check_interval_secs: 75,
        }
    }
}

/// Logging options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily-rolling log files are written here when set
    pub dir: Option<PathBuf>,
    pub json: bool,
    /// Log every sent/received chunk as hex
    pub show_traffic: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
            show_traffic: false,
        }
    }
}

/// Values given on the command line; they win over every other layer
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

impl RelayConfig {
    /// Load from `path` (or [`DEFAULT_CONFIG_PATH`] when present), the
    /// environment and `overrides`, then validate
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RelayConfig::default()));

        let path = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(RelaySrvError::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            },
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            },
        };

        if let Some(path) = &path {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            figment = match extension.as_str() {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                other => {
                    return Err(RelaySrvError::Config(format!(
                        "Unsupported config format: {}",
                        other
                    )))
                },
            };
            debug!("Config file: {}", path.display());
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(host) = &overrides.host {
            figment = figment.merge(Serialized::default("device.host", host));
        }
        if let Some(port) = overrides.port {
            figment = figment.merge(Serialized::default("device.port", port));
        }
        if let Some(level) = &overrides.log_level {
            figment = figment.merge(Serialized::default("logging.level", level));
        }

        let config: RelayConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without the file/env layers
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RelayConfig = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.host.trim().is_empty() {
            return Err(RelaySrvError::Config("device.host cannot be empty".to_string()));
        }
        if self.device.port == 0 {
            return Err(RelaySrvError::Config("device.port cannot be zero".to_string()));
        }

        let profile_name = self.device.profile.trim();
        if profile_name.eq_ignore_ascii_case(CUSTOM_PROFILE) {
            for bank in &self.device.coil_banks {
                check_count("coil", bank, MAX_READ_COILS)?;
            }
            for bank in &self.device.register_banks {
                check_count("register", bank, MAX_READ_REGISTERS)?;
            }
        }
        self.banks()?;

        let timing = &self.timing;
        let named = [
            ("bounce_ms", timing.bounce_ms),
            ("read_only_poll_ms", timing.read_only_poll_ms),
            ("writable_poll_ms", timing.writable_poll_ms),
            ("protocol_timeout_ms", timing.protocol_timeout_ms),
            ("transport_timeout_ms", timing.transport_timeout_ms),
            ("connect_timeout_ms", timing.connect_timeout_ms),
            ("reconnect_delay_ms", timing.reconnect_delay_ms),
            ("status_check_interval_secs", timing.status_check_interval_secs),
        ];
        if let Some((name, _)) = named.iter().find(|(_, value)| *value == 0) {
            return Err(RelaySrvError::Config(format!(
                "timing.{} must be greater than zero",
                name
            )));
        }
        if timing.protocol_timeout_ms >= timing.transport_timeout_ms {
            return Err(RelaySrvError::Config(format!(
                "timing.protocol_timeout_ms ({}) must be below timing.transport_timeout_ms ({})",
                timing.protocol_timeout_ms, timing.transport_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn profile(&self) -> Result<DeviceProfile> {
        let name = self.device.profile.trim();
        if name.eq_ignore_ascii_case(CUSTOM_PROFILE) {
            return Ok(DeviceProfile::Custom {
                coil_banks: self
                    .device
                    .coil_banks
                    .iter()
                    .map(|bank| {
                        AddressBank::coils(bank.start_address, bank.count, &bank.prefix, bank.read_only)
                    })
                    .collect(),
                register_banks: self
                    .device
                    .register_banks
                    .iter()
                    .map(|bank| AddressBank::registers(bank.start_address, bank.count, &bank.prefix))
                    .collect(),
            });
        }

        let device: KnownDevice = name
            .parse()
            .map_err(|e| RelaySrvError::Config(format!("device.profile: {}", e)))?;
        Ok(DeviceProfile::Known(device))
    }

    /// Settings that load fine but have no effect
    pub fn ignored_settings(&self) -> Vec<String> {
        let custom = self.device.profile.trim().eq_ignore_ascii_case(CUSTOM_PROFILE);
        let has_banks =
            !self.device.coil_banks.is_empty() || !self.device.register_banks.is_empty();
        if !custom && has_banks {
            vec![format!(
                "device.coil_banks/register_banks ignored for profile {}",
                self.device.profile
            )]
        } else {
            Vec::new()
        }
    }

    /// Call once logging is up
    pub fn log_warnings(&self) {
        for warning in self.ignored_settings() {
            warn!("{}", warning);
        }
    }

    /// Resolved address banks
    pub fn banks(&self) -> Result<Vec<AddressBank>> {
        self.profile()?
            .resolve()
            .map_err(|e| RelaySrvError::Config(e.to_string()))
    }

    pub fn points(&self) -> HashMap<String, PointOptions> {
        self.points
            .iter()
            .map(|(name, options)| (name.trim().to_string(), options.clone()))
            .collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        let timing = &self.timing;
        SessionConfig {
            poll: PollTiming {
                read_only: Duration::from_millis(timing.read_only_poll_ms),
                writable: Duration::from_millis(timing.writable_poll_ms),
            },
            bounce: Duration::from_millis(timing.bounce_ms),
            protocol_timeout: Duration::from_millis(timing.protocol_timeout_ms),
            status_interval: Duration::from_secs(timing.status_check_interval_secs),
            show_traffic: self.logging.show_traffic,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        let timing = &self.timing;
        LinkConfig {
            host: self.device.host.clone(),
            port: self.device.port,
            connect_timeout: Duration::from_millis(timing.connect_timeout_ms),
            transport_timeout: Duration::from_millis(timing.transport_timeout_ms),
            reconnect_delay: Duration::from_millis(timing.reconnect_delay_ms),
        }
    }

    /// One-line summary for the startup log
    pub fn log_summary(&self) {
        info!(
            "Device {}:{} profile {} ({} point option(s))",
            self.device.host,
            self.device.port,
            self.device.profile,
            self.points.len()
        );
    }
}

fn check_count(kind: &str, bank: &BankConfig, max: u16) -> Result<()> {
    if bank.count == 0 || bank.count > max {
        return Err(RelaySrvError::Config(format!(
            "{} bank '{}': count {} not in 1..={}",
            kind, bank.prefix, bank.count, max
        )));
    }
    Ok(())
}
