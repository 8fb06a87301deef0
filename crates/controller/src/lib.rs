//! Valve controllers: manual positioning and PID temperature control.

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum InputError {
    #[error("{name} must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },

    #[error("integral limits must satisfy min <= max, got ({min}, {max})")]
    InvertedLimits { min: f64, max: f64 },

    #[error("unknown control mode `{0}` (expected `manual` or `pid`)")]
    UnknownMode(String),
}

/// Anything that can decide where the valve goes next.
pub trait Controller {
    /// Valve position in `[0, 1]` to hold over the next `dt_s` seconds.
    fn compute_valve_position(&mut self, reactor_temp: f64, dt_s: f64) -> f64;
}

fn finite(name: &'static str, value: f64) -> Result<f64, InputError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(InputError::NonFinite { name, value })
    }
}

/// Boundary check for operator-supplied valve positions: clamps into `[0, 1]`.
pub fn sanitize_valve_position(value: f64) -> Result<f64, InputError> {
    let v = finite("valve position", value)?;
    let clamped = v.clamp(0.0, 1.0);
    if clamped != v {
        warn!("valve position {v} out of range, clamped to {clamped}");
    }
    Ok(clamped)
}

/// Boundary check for PID gains: negative gains are clamped to zero.
pub fn sanitize_gain(name: &'static str, value: f64) -> Result<f64, InputError> {
    let v = finite(name, value)?;
    if v < 0.0 {
        warn!("{name} = {v} is negative, using 0");
        return Ok(0.0);
    }
    Ok(v)
}

pub fn sanitize_setpoint(value: f64) -> Result<f64, InputError> {
    finite("setpoint", value)
}

/// Open loop: the valve stays wherever the operator put it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ManualValve {
    position: f64,
}

impl ManualValve {
    pub fn new(position: f64) -> Self {
        Self {
            position: if position.is_finite() {
                position.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Returns the position actually applied after clamping.
    pub fn set(&mut self, position: f64) -> Result<f64, InputError> {
        self.position = sanitize_valve_position(position)?;
        Ok(self.position)
    }
}

impl Controller for ManualValve {
    fn compute_valve_position(&mut self, _reactor_temp: f64, _dt_s: f64) -> f64 {
        self.position
    }
}

/// Sign convention of the error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// `error = setpoint - measurement`: opening the valve raises the temperature.
    #[default]
    Direct,
    /// `error = measurement - setpoint`: opening the valve lowers the temperature.
    Reverse,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub out_min: f64,
    pub out_max: f64,
    pub action: Action,
    /// Bounds applied to the accumulated integral. `None` lets it wind up.
    pub integral_limits: Option<(f64, f64)>,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.05,
            ki: 0.001,
            kd: 0.5,
            setpoint: 31.0,
            out_min: 0.0,
            out_max: 1.0,
            action: Action::Direct,
            integral_limits: None,
        }
    }
}

impl PidConfig {
    pub fn validate(&self) -> Result<(), InputError> {
        finite("kp", self.kp)?;
        finite("ki", self.ki)?;
        finite("kd", self.kd)?;
        sanitize_setpoint(self.setpoint)?;
        finite("out_min", self.out_min)?;
        finite("out_max", self.out_max)?;
        if self.out_min > self.out_max {
            return Err(InputError::InvertedLimits {
                min: self.out_min,
                max: self.out_max,
            });
        }
        if let Some((min, max)) = self.integral_limits {
            finite("integral min", min)?;
            finite("integral max", max)?;
            if min > max {
                return Err(InputError::InvertedLimits { min, max });
            }
        }
        Ok(())
    }
}

/// Breakdown of one PID evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PidTerms {
    pub error: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub unclamped: f64,
    pub output: f64,
}

#[derive(Clone, Debug)]
pub struct Pid {
    cfg: PidConfig,
    integral: f64,
    prev_error: Option<f64>,
    last_output: f64,
}

impl Pid {
    /// Negative gains are clamped to zero; non-finite ones are left for
    /// [`PidConfig::validate`] to reject.
    pub fn new(mut cfg: PidConfig) -> Self {
        for (name, gain) in [("kp", &mut cfg.kp), ("ki", &mut cfg.ki), ("kd", &mut cfg.kd)] {
            if let Ok(clamped) = sanitize_gain(name, *gain) {
                *gain = clamped;
            }
        }
        Self {
            cfg,
            integral: 0.0,
            prev_error: None,
            last_output: cfg.out_min,
        }
    }

    /// Starts with the integral preloaded so the first output equals `initial_output`.
    pub fn bumpless(cfg: PidConfig, initial_output: f64) -> Self {
        let mut pid = Self::new(cfg);
        pid.preset(initial_output);
        pid
    }

    pub fn config(&self) -> &PidConfig {
        &self.cfg
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    /// Clears the derivative history and preloads the integral for a
    /// bumpless hand-over at `output`.
    pub fn preset(&mut self, output: f64) {
        let output = if output.is_finite() {
            output.clamp(self.cfg.out_min, self.cfg.out_max)
        } else {
            self.cfg.out_min
        };
        self.integral = if self.cfg.ki != 0.0 {
            output / self.cfg.ki
        } else {
            0.0
        };
        self.integral = self.limit_integral(self.integral);
        self.prev_error = None;
        self.last_output = output;
    }

    pub fn reset(&mut self) {
        self.preset(self.last_output);
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), InputError> {
        let kp = sanitize_gain("kp", kp)?;
        let ki = sanitize_gain("ki", ki)?;
        let kd = sanitize_gain("kd", kd)?;
        self.cfg.kp = kp;
        self.cfg.ki = ki;
        self.cfg.kd = kd;
        Ok(())
    }

    /// A changed setpoint restarts the controller from its current output.
    /// Returns whether the setpoint changed.
    pub fn set_setpoint(&mut self, setpoint: f64) -> Result<bool, InputError> {
        let setpoint = sanitize_setpoint(setpoint)?;
        if setpoint == self.cfg.setpoint {
            return Ok(false);
        }
        self.cfg.setpoint = setpoint;
        self.reset();
        Ok(true)
    }

    fn limit_integral(&self, value: f64) -> f64 {
        match self.cfg.integral_limits {
            Some((min, max)) => value.clamp(min, max),
            None => value,
        }
    }

    /// Runs one evaluation and returns every term.
    pub fn step(&mut self, measurement: f64, dt_s: f64) -> PidTerms {
        let error = match self.cfg.action {
            Action::Direct => self.cfg.setpoint - measurement,
            Action::Reverse => measurement - self.cfg.setpoint,
        };

        if dt_s > 0.0 {
            self.integral = self.limit_integral(self.integral + error * dt_s);
        }

        let deriv = match self.prev_error {
            Some(prev) if dt_s > 0.0 => (error - prev) / dt_s,
            _ => 0.0,
        };
        self.prev_error = Some(error);

        let proportional = self.cfg.kp * error;
        let integral = self.cfg.ki * self.integral;
        let derivative = self.cfg.kd * deriv;
        let unclamped = proportional + integral + derivative;

        // Saturate the output only; the integral keeps accumulating.
        let output = if unclamped.is_nan() {
            self.last_output
        } else {
            unclamped.clamp(self.cfg.out_min, self.cfg.out_max)
        };
        self.last_output = output;

        let terms = PidTerms {
            error,
            proportional,
            integral,
            derivative,
            unclamped,
            output,
        };
        debug!(
            "pid: e={:.4} P={:.6} I={:.6} D={:.6} integral={:.6} raw={:.6} av={:.6}",
            terms.error,
            terms.proportional,
            terms.integral,
            terms.derivative,
            self.integral,
            terms.unclamped,
            terms.output
        );
        terms
    }

    /// Update PID given a measurement. Returns a saturated output [out_min, out_max].
    pub fn update(&mut self, measurement: f64, dt_s: f64) -> f64 {
        self.step(measurement, dt_s).output
    }
}

impl Controller for Pid {
    fn compute_valve_position(&mut self, reactor_temp: f64, dt_s: f64) -> f64 {
        self.update(reactor_temp, dt_s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Manual,
    Pid,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Manual => f.write_str("manual"),
            Mode::Pid => f.write_str("pid"),
        }
    }
}

impl FromStr for Mode {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "open-loop" | "open_loop" => Ok(Mode::Manual),
            "pid" | "closed-loop" | "closed_loop" => Ok(Mode::Pid),
            other => Err(InputError::UnknownMode(other.to_string())),
        }
    }
}

/// Both control strategies, one of them active.
///
/// The inactive controller keeps its settings so the operator can tune the
/// PID before engaging it; switching hands the valve over without a bump.
#[derive(Clone, Debug)]
pub struct ControlLaw {
    mode: Mode,
    manual: ManualValve,
    pid: Pid,
}

impl ControlLaw {
    pub fn new(mode: Mode, initial_valve: f64, pid: PidConfig) -> Self {
        let manual = ManualValve::new(initial_valve);
        Self {
            mode,
            manual,
            pid: Pid::bumpless(pid, manual.position()),
        }
    }

    pub fn manual(position: f64) -> Self {
        Self::new(Mode::Manual, position, PidConfig::default())
    }

    pub fn pid(cfg: PidConfig, initial_valve: f64) -> Self {
        Self::new(Mode::Pid, initial_valve, cfg)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pid_controller(&self) -> &Pid {
        &self.pid
    }

    pub fn manual_valve(&self) -> &ManualValve {
        &self.manual
    }

    /// Setpoint being tracked, if the loop is closed.
    pub fn setpoint(&self) -> Option<f64> {
        match self.mode {
            Mode::Manual => None,
            Mode::Pid => Some(self.pid.config().setpoint),
        }
    }

    /// Valve position most recently commanded by the active controller.
    pub fn valve_position(&self) -> f64 {
        match self.mode {
            Mode::Manual => self.manual.position(),
            Mode::Pid => self.pid.last_output(),
        }
    }

    pub fn set_valve_position(&mut self, position: f64) -> Result<f64, InputError> {
        let applied = self.manual.set(position)?;
        if self.mode == Mode::Pid {
            info!("valve position {applied:.3} stored; PID is in control");
        }
        Ok(applied)
    }

    pub fn set_pid_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), InputError> {
        self.pid.set_gains(kp, ki, kd)
    }

    pub fn set_setpoint(&mut self, setpoint: f64) -> Result<bool, InputError> {
        self.pid.set_setpoint(setpoint)
    }

    pub fn select(&mut self, mode: Mode) {
        if mode == self.mode {
            return;
        }
        let current = self.valve_position();
        match mode {
            Mode::Manual => self.manual = ManualValve::new(current),
            Mode::Pid => self.pid.preset(current),
        }
        info!("control mode {} -> {} at av={current:.4}", self.mode, mode);
        self.mode = mode;
    }
}

impl Controller for ControlLaw {
    fn compute_valve_position(&mut self, reactor_temp: f64, dt_s: f64) -> f64 {
        match self.mode {
            Mode::Manual => self.manual.compute_valve_position(reactor_temp, dt_s),
            Mode::Pid => self.pid.compute_valve_position(reactor_temp, dt_s),
        }
    }
}
