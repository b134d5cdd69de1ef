//! Writable coils and their momentary actions
//!
//! Each writable coil owns one [`RetriggerableTimer`], shared by bounce and
//! flash. Re-arming the timer bumps its generation, so a fire scheduled by
//! an earlier arm is recognised as stale and ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ModbusError;

/// Single-shot or periodic timer that is cancelled by re-arming
#[derive(Debug, Clone)]
pub struct RetriggerableTimer {
    delay: Duration,
    interval: Option<Duration>,
    generation: u64,
    armed: bool,
}

/// What to do after a valid fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFire {
    /// Single-shot: the timer is now idle
    Once,
    /// Periodic: schedule the next fire after the interval
    Repeat(Duration),
}

impl RetriggerableTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            interval: None,
            generation: 0,
            armed: false,
        }
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// `None` makes the timer single-shot
    pub fn set_interval(&mut self, interval: Option<Duration>) {
        self.interval = interval;
    }

    /// Arm (or re-arm) the timer. Returns the generation to schedule and the
    /// delay until its first fire.
    pub fn start(&mut self) -> (u64, Duration) {
        self.generation += 1;
        self.armed = true;
        (self.generation, self.delay)
    }

    /// Disarm; any fire already scheduled becomes stale
    pub fn stop(&mut self) {
        self.generation += 1;
        self.armed = false;
    }

    /// Validate a scheduled fire. Returns `None` for stale generations.
    pub fn fire(&mut self, generation: u64) -> Option<TimerFire> {
        if !self.armed || generation != self.generation {
            return None;
        }
        match self.interval {
            Some(interval) => Some(TimerFire::Repeat(interval)),
            None => {
                self.armed = false;
                Some(TimerFire::Once)
            },
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Operator action on a writable coil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoilAction {
    State(bool),
    /// Same as `State(false)`
    Open,
    /// Same as `State(true)`
    Close,
    /// Close, then revert after the bounce delay
    Bounce,
    /// Start (true) or stop (false) periodic toggling
    Flash(bool),
}

impl fmt::Display for CoilAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "state {state}"),
            Self::Open => f.write_str("open"),
            Self::Close => f.write_str("close"),
            Self::Bounce => f.write_str("bounce"),
            Self::Flash(true) => f.write_str("flash-on"),
            Self::Flash(false) => f.write_str("flash-off"),
        }
    }
}

impl FromStr for CoilAction {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" | "true" | "state-on" => Ok(Self::State(true)),
            "off" | "false" | "state-off" => Ok(Self::State(false)),
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            "bounce" => Ok(Self::Bounce),
            "flash" | "flash-on" => Ok(Self::Flash(true)),
            "flash-off" => Ok(Self::Flash(false)),
            other => Err(ModbusError::InvalidRequest(format!(
                "unknown coil action: {other}"
            ))),
        }
    }
}

/// One writable coil
#[derive(Debug, Clone)]
pub struct CoilOutput {
    pub name: String,
    pub label: Option<String>,
    pub address: u16,
    pub invert: bool,
    /// Hardware state as last confirmed by a write response
    pub current_state: Option<bool>,
    /// State most recently commanded; toggles are based on this
    pub requested_state: Option<bool>,
    /// Index of the published state signal
    pub signal: usize,
    pub timer: RetriggerableTimer,
}

impl CoilOutput {
    /// State to report upward for a hardware state
    pub fn display_state(&self, hardware: bool) -> bool {
        hardware != self.invert
    }

    /// Opposite of the last commanded state
    pub fn toggled(&self) -> bool {
        !self.requested_state.or(self.current_state).unwrap_or(false)
    }
}

/// A write the session must issue on behalf of a coil
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilWrite {
    pub coil: usize,
    pub address: u16,
    pub state: bool,
}

/// Timer arming the session must schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerArm {
    pub coil: usize,
    pub generation: u64,
    pub delay: Duration,
}

/// Side effects of one coil action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    pub write: Option<CoilWrite>,
    pub arm: Option<TimerArm>,
}

/// Owner of all writable coils
#[derive(Debug, Default)]
pub struct OutputController {
    coils: Vec<CoilOutput>,
    bounce: Duration,
}

impl OutputController {
    pub fn new(bounce: Duration) -> Self {
        Self {
            coils: Vec::new(),
            bounce,
        }
    }

    pub fn add(
        &mut self,
        name: String,
        label: Option<String>,
        address: u16,
        invert: bool,
        signal: usize,
    ) -> usize {
        self.coils.push(CoilOutput {
            name,
            label,
            address,
            invert,
            current_state: None,
            requested_state: None,
            signal,
            timer: RetriggerableTimer::new(self.bounce),
        });
        self.coils.len() - 1
    }

    /// Find a coil by point name ("Relay 1") or label, case-insensitive
    pub fn find(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.coils.iter().position(|coil| {
            coil.name.eq_ignore_ascii_case(name)
                || coil
                    .label
                    .as_deref()
                    .is_some_and(|label| label.eq_ignore_ascii_case(name))
        })
    }

    pub fn get(&self, coil: usize) -> Option<&CoilOutput> {
        self.coils.get(coil)
    }

    pub fn coils(&self) -> &[CoilOutput] {
        &self.coils
    }

    pub fn len(&self) -> usize {
        self.coils.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coils.is_empty()
    }

    /// Plan the effects of `action` on `coil`
    pub fn apply(&mut self, coil: usize, action: CoilAction) -> ActionPlan {
        let bounce = self.bounce;
        let Some(output) = self.coils.get_mut(coil) else {
            return ActionPlan::default();
        };

        match action {
            CoilAction::State(state) => ActionPlan {
                write: Some(set_state(coil, output, state)),
                arm: None,
            },
            CoilAction::Open => ActionPlan {
                write: Some(set_state(coil, output, false)),
                arm: None,
            },
            CoilAction::Close => ActionPlan {
                write: Some(set_state(coil, output, true)),
                arm: None,
            },
            CoilAction::Bounce => {
                let write = set_state(coil, output, true);
                output.timer.set_delay(bounce);
                output.timer.set_interval(None);
                let (generation, delay) = output.timer.start();
                ActionPlan {
                    write: Some(write),
                    arm: Some(TimerArm {
                        coil,
                        generation,
                        delay,
                    }),
                }
            },
            CoilAction::Flash(true) => {
                let write = set_state(coil, output, true);
                output.timer.set_delay(bounce);
                output.timer.set_interval(Some(bounce));
                let (generation, delay) = output.timer.start();
                ActionPlan {
                    write: Some(write),
                    arm: Some(TimerArm {
                        coil,
                        generation,
                        delay,
                    }),
                }
            },
            CoilAction::Flash(false) => {
                output.timer.stop();
                ActionPlan::default()
            },
        }
    }

    /// Handle a timer fire: toggle the coil and, for flashing, re-arm
    pub fn timer_fired(&mut self, coil: usize, generation: u64) -> ActionPlan {
        let Some(output) = self.coils.get_mut(coil) else {
            return ActionPlan::default();
        };
        let Some(fire) = output.timer.fire(generation) else {
            return ActionPlan::default();
        };

        let next = output.toggled();
        let write = set_state(coil, output, next);
        let arm = match fire {
            TimerFire::Once => None,
            TimerFire::Repeat(delay) => Some(TimerArm {
                coil,
                generation,
                delay,
            }),
        };
        ActionPlan {
            write: Some(write),
            arm,
        }
    }

    /// Record the state confirmed by the device; returns the display state
    pub fn confirm(&mut self, coil: usize, state: bool) -> Option<bool> {
        let output = self.coils.get_mut(coil)?;
        output.current_state = Some(state);
        Some(output.display_state(state))
    }

    /// Disarm every timer (used on shutdown)
    pub fn stop_all(&mut self) {
        for coil in &mut self.coils {
            coil.timer.stop();
        }
    }
}

fn set_state(coil: usize, output: &mut CoilOutput, state: bool) -> CoilWrite {
    output.requested_state = Some(state);
    CoilWrite {
        coil,
        address: output.address,
        state,
    }
}
