//! Device health status derived from receive activity

use chrono::{DateTime, Local};
use std::time::Duration;

use crate::constants::STATUS_MISSING_GRACE;

/// Status level: device communicating
pub const LEVEL_OK: u8 = 0;
/// Status level: device missing
pub const LEVEL_MISSING: u8 = 2;

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    /// Data arrived recently; `contact` is the new last-contact timestamp
    Ok { contact: DateTime<Local> },
    /// Nothing received for longer than the check interval plus grace
    Missing { message: String },
}

impl HealthReport {
    pub fn level(&self) -> u8 {
        match self {
            Self::Ok { .. } => LEVEL_OK,
            Self::Missing { .. } => LEVEL_MISSING,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Ok { .. } => "OK",
            Self::Missing { message } => message,
        }
    }
}

/// Tracks the last detected contact and classifies silence
#[derive(Debug)]
pub struct StatusMonitor {
    interval: Duration,
    last_contact: Option<DateTime<Local>>,
}

impl StatusMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_contact: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_contact(&self) -> Option<DateTime<Local>> {
        self.last_contact
    }

    /// Classify the link given the time since the last received byte
    /// (`None` if nothing was ever received).
    pub fn check(&mut self, since_receive: Option<Duration>, now: DateTime<Local>) -> HealthReport {
        let silent = since_receive
            .is_none_or(|elapsed| elapsed > self.interval + STATUS_MISSING_GRACE);
        if !silent {
            self.last_contact = Some(now);
            return HealthReport::Ok { contact: now };
        }

        let message = match self.last_contact {
            None => "Always been missing.".to_string(),
            Some(contact) => missing_message(contact, now),
        };
        HealthReport::Missing { message }
    }
}

fn missing_message(contact: DateTime<Local>, now: DateTime<Local>) -> String {
    let minutes = (now - contact).num_minutes();
    if minutes < 60 {
        format!("Missing for approx. {minutes} mins")
    } else if minutes < 60 * 24 {
        format!("Missing since {}", contact.format("%-I:%M:%S %p"))
    } else {
        format!("Missing since {}", contact.format("%-I:%M:%S %p, %a %-d-%b"))
    }
}
