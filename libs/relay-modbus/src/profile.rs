//! Address banks and device profiles
//!
//! A profile is resolved once at startup into a flat list of
//! [`AddressBank`]s; banks are never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS};
use crate::error::{ModbusError, Result};

/// What a bank addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BankKind {
    Coil,
    Register,
}

/// A contiguous block of coils or registers polled with one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBank {
    pub start_address: u16,
    pub count: u16,
    /// Event name prefix, e.g. "Input" gives "Input 1 State"
    pub prefix: String,
    #[serde(default)]
    pub read_only: bool,
    pub kind: BankKind,
}

impl AddressBank {
    pub fn coils(start_address: u16, count: u16, prefix: &str, read_only: bool) -> Self {
        Self {
            start_address,
            count,
            prefix: prefix.to_string(),
            read_only,
            kind: BankKind::Coil,
        }
    }

    /// Register banks are always read-only
    pub fn registers(start_address: u16, count: u16, prefix: &str) -> Self {
        Self {
            start_address,
            count,
            prefix: prefix.to_string(),
            read_only: true,
            kind: BankKind::Register,
        }
    }

    /// Register writes are not supported, so the configured flag is ignored
    pub fn is_writable(&self) -> bool {
        self.kind == BankKind::Coil && !self.read_only
    }

    /// Point name of the item at `offset` (1-based numbering)
    pub fn point_name(&self, offset: u16) -> String {
        format!("{} {}", self.prefix, offset + 1)
    }

    /// Address of the item at `offset`
    pub fn address(&self, offset: u16) -> u16 {
        self.start_address.wrapping_add(offset)
    }

    pub fn validate(&self) -> Result<()> {
        let max = match self.kind {
            BankKind::Coil => MAX_READ_COILS,
            BankKind::Register => MAX_READ_REGISTERS,
        };
        if self.count == 0 || self.count > max {
            return Err(ModbusError::InvalidRequest(format!(
                "bank '{}': count {} not in 1..={}",
                self.prefix, self.count, max
            )));
        }
        if u32::from(self.start_address) + u32::from(self.count) > 0x1_0000 {
            return Err(ModbusError::InvalidRequest(format!(
                "bank '{}': {}+{} exceeds address space",
                self.prefix, self.start_address, self.count
            )));
        }
        if self.prefix.trim().is_empty() {
            return Err(ModbusError::InvalidRequest(
                "bank prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Devices with a built-in address map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnownDevice {
    /// Advantech ADAM-6050: 12 digital inputs, 6 digital outputs
    #[serde(rename = "adam-6050")]
    Adam6050,
    /// Advantech ADAM-6060: 6 digital inputs, 6 relays
    #[serde(rename = "adam-6060")]
    Adam6060,
}

impl KnownDevice {
    pub fn description(self) -> &'static str {
        match self {
            Self::Adam6050 => "Advantech ADAM 6050 (12xDI 6xDO)",
            Self::Adam6060 => "Advantech ADAM 6060 (6xDI 6xrelay)",
        }
    }

    pub fn banks(self) -> Vec<AddressBank> {
        match self {
            Self::Adam6050 => vec![
                AddressBank::coils(0, 12, "Input", true),
                AddressBank::coils(16, 6, "Output", false),
            ],
            Self::Adam6060 => vec![
                AddressBank::coils(0, 6, "Input", true),
                AddressBank::coils(16, 6, "Relay", false),
            ],
        }
    }
}

impl fmt::Display for KnownDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for KnownDevice {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['_', ' '], "-").as_str() {
            "adam-6050" | "adam6050" => Ok(Self::Adam6050),
            "adam-6060" | "adam6060" => Ok(Self::Adam6060),
            other => Err(ModbusError::InvalidRequest(format!(
                "unknown device profile: {other}"
            ))),
        }
    }
}

/// Where the address map comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceProfile {
    Known(KnownDevice),
    Custom {
        coil_banks: Vec<AddressBank>,
        register_banks: Vec<AddressBank>,
    },
}

impl DeviceProfile {
    /// Flatten into banks: coil banks first, then register banks
    pub fn resolve(&self) -> Result<Vec<AddressBank>> {
        let banks = match self {
            Self::Known(device) => device.banks(),
            Self::Custom {
                coil_banks,
                register_banks,
            } => coil_banks
                .iter()
                .cloned()
                .map(|bank| AddressBank {
                    kind: BankKind::Coil,
                    ..bank
                })
                .chain(register_banks.iter().map(|bank| {
                    AddressBank::registers(bank.start_address, bank.count, &bank.prefix)
                }))
                .collect(),
        };

        for bank in &banks {
            bank.validate()?;
        }
        Ok(banks)
    }
}

/// Per-point display options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointOptions {
    /// Report the inverse of the hardware state (coils only)
    #[serde(default)]
    pub invert: bool,
    /// Alternate name under which the point is mirrored
    #[serde(default)]
    pub label: Option<String>,
}

impl PointOptions {
    pub fn label(&self) -> Option<&str> {
        self.label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
    }
}
