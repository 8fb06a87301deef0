use std::fmt;
use std::str::FromStr;

use controller::{sanitize_gain, sanitize_setpoint, sanitize_valve_position, InputError, Mode};

use crate::ClockError;

/// Operator intents. Queued by the clock and applied at the next tick boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    SetValvePosition(f64),
    SetPidGains { kp: f64, ki: f64, kd: f64 },
    SetSetpoint(f64),
    SelectMode(Mode),
    Stop,
}

impl Command {
    /// Boundary correction: clamps what can be clamped, rejects non-finite values.
    pub fn sanitized(self) -> Result<Command, InputError> {
        Ok(match self {
            Command::SetValvePosition(v) => Command::SetValvePosition(sanitize_valve_position(v)?),
            Command::SetPidGains { kp, ki, kd } => Command::SetPidGains {
                kp: sanitize_gain("kp", kp)?,
                ki: sanitize_gain("ki", ki)?,
                kd: sanitize_gain("kd", kd)?,
            },
            Command::SetSetpoint(t) => Command::SetSetpoint(sanitize_setpoint(t)?),
            other => other,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetValvePosition(v) => write!(f, "valve={v}"),
            Command::SetPidGains { kp, ki, kd } => write!(f, "gains={kp},{ki},{kd}"),
            Command::SetSetpoint(t) => write!(f, "setpoint={t}"),
            Command::SelectMode(m) => write!(f, "mode={m}"),
            Command::Stop => f.write_str("stop"),
        }
    }
}

fn number(text: &str, raw: &str) -> Result<f64, ClockError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ClockError::UnknownCommand(raw.to_string()))
}

/// `valve=0.3`, `gains=2,0.1,0.5`, `setpoint=28`, `mode=pid`, `stop`
impl FromStr for Command {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.eq_ignore_ascii_case("stop") {
            return Ok(Command::Stop);
        }
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ClockError::UnknownCommand(raw.to_string()))?;

        match key.trim().to_ascii_lowercase().as_str() {
            "valve" | "av" => Ok(Command::SetValvePosition(number(value, raw)?)),
            "setpoint" | "sp" => Ok(Command::SetSetpoint(number(value, raw)?)),
            "mode" => Ok(Command::SelectMode(value.parse()?)),
            "gains" | "pid" => {
                let parts: Vec<&str> = value.split(',').collect();
                let [kp, ki, kd] = parts.as_slice() else {
                    return Err(ClockError::UnknownCommand(raw.to_string()));
                };
                Ok(Command::SetPidGains {
                    kp: number(kp, raw)?,
                    ki: number(ki, raw)?,
                    kd: number(kd, raw)?,
                })
            }
            _ => Err(ClockError::UnknownCommand(raw.to_string())),
        }
    }
}

/// A command to be issued once simulated time reaches `at`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledCommand {
    pub at: f64,
    pub command: Command,
}

/// `AT:COMMAND`, e.g. `120:setpoint=28`
impl FromStr for ScheduledCommand {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (at, command) = s
            .split_once(':')
            .ok_or_else(|| ClockError::UnknownCommand(s.to_string()))?;
        let at = number(at, s)?;
        if at < 0.0 {
            return Err(ClockError::UnknownCommand(s.to_string()));
        }
        Ok(Self {
            at,
            command: command.parse()?,
        })
    }
}

/// Where the run loop gets operator commands from.
pub trait CommandSource {
    /// Commands that became due at or before `sim_time`.
    fn poll(&mut self, sim_time: f64) -> Vec<Command>;
}

pub struct NoCommands;

impl CommandSource for NoCommands {
    fn poll(&mut self, _sim_time: f64) -> Vec<Command> {
        Vec::new()
    }
}

/// Fixed script of commands, released in time order.
#[derive(Clone, Debug, Default)]
pub struct ScheduledCommands {
    queue: Vec<ScheduledCommand>,
    next: usize,
}

impl ScheduledCommands {
    pub fn new(mut queue: Vec<ScheduledCommand>) -> Self {
        // Stable: commands scheduled for the same instant keep their order.
        queue.sort_by(|a, b| a.at.total_cmp(&b.at));
        Self { queue, next: 0 }
    }
}

impl CommandSource for ScheduledCommands {
    fn poll(&mut self, sim_time: f64) -> Vec<Command> {
        let mut due = Vec::new();
        while let Some(sc) = self.queue.get(self.next) {
            if sc.at > sim_time + 1e-9 {
                break;
            }
            due.push(sc.command);
            self.next += 1;
        }
        due
    }
}
