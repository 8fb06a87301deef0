//! Drives the reactor: reads the controller, integrates one step, reports.
//!
//! The clock owns every piece of mutable simulation state. Operators reach
//! it only through [`Command`]s, which are queued and applied at the start
//! of the next tick, so a step always sees one consistent set of inputs.

mod command;
mod sink;
mod time;

pub use command::{Command, CommandSource, NoCommands, ScheduledCommand, ScheduledCommands};
pub use sink::{Sample, SampleSink, TraceWindow};
pub use time::{Pacing, TimeBase};

use std::collections::VecDeque;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use controller::{ControlLaw, Controller, InputError, Mode};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sim::{integrate, PhysicalParameters, ReactorState, SimError, SolverOptions};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Stopped,
    /// Terminal: an integration step failed.
    Faulted,
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClockState::Idle => "idle",
            ClockState::Running => "running",
            ClockState::Stopped => "stopped",
            ClockState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("clock can only start from idle (currently {0})")]
    NotIdle(ClockState),

    #[error("cannot parse command `{0}`")]
    UnknownCommand(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Simulated seconds per tick.
    pub step: f64,
    pub pacing: Pacing,
    pub solver: SolverOptions,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            step: 1.0,
            pacing: Pacing::Unpaced,
            solver: SolverOptions::default(),
        }
    }
}

impl ClockConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(SimError::Configuration(format!(
                "step must be finite and > 0, got {}",
                self.step
            )));
        }
        if !self.pacing.is_valid(self.step) {
            return Err(SimError::Configuration(format!(
                "invalid pacing {:?}",
                self.pacing
            )));
        }
        self.solver.validate()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickOutcome {
    Advanced(Sample),
    /// Nothing happened: the clock is not running.
    Inactive(ClockState),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Stopped,
    Faulted(SimError),
}

pub struct SimulationClock {
    state: ClockState,
    params: PhysicalParameters,
    reactor: ReactorState,
    law: ControlLaw,
    config: ClockConfig,
    time: TimeBase,
    pending: VecDeque<Command>,
    fault: Option<SimError>,
}

impl SimulationClock {
    /// Fails fast on bad parameters; nothing is re-validated once running.
    pub fn new(
        params: PhysicalParameters,
        initial: ReactorState,
        law: ControlLaw,
        config: ClockConfig,
    ) -> Result<Self, SimError> {
        params.validate()?;
        config.validate()?;
        if !initial.is_finite() {
            return Err(SimError::Configuration(format!(
                "initial state must be finite, got {initial:?}"
            )));
        }
        law.pid_controller()
            .config()
            .validate()
            .map_err(|e| SimError::Configuration(e.to_string()))?;

        Ok(Self {
            state: ClockState::Idle,
            params,
            reactor: initial,
            law,
            config,
            time: TimeBase::new(config.step),
            pending: VecDeque::new(),
            fault: None,
        })
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn reactor(&self) -> &ReactorState {
        &self.reactor
    }

    pub fn control(&self) -> &ControlLaw {
        &self.law
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn sim_time(&self) -> f64 {
        self.time.sim_time()
    }

    pub fn fault(&self) -> Option<&SimError> {
        self.fault.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn start(&mut self) -> Result<(), ClockError> {
        self.start_at(Instant::now())
    }

    pub fn start_at(&mut self, now: Instant) -> Result<(), ClockError> {
        if self.state != ClockState::Idle {
            return Err(ClockError::NotIdle(self.state));
        }
        self.time.start(now);
        self.state = ClockState::Running;
        info!(
            "simulation started: mode={} dt={}s pacing={:?}",
            self.law.mode(),
            self.time.step(),
            self.config.pacing
        );
        Ok(())
    }

    /// Ends the run immediately. Has no effect once stopped or faulted.
    pub fn stop(&mut self) {
        if matches!(self.state, ClockState::Idle | ClockState::Running) {
            self.state = ClockState::Stopped;
            self.pending.clear();
            info!("simulation stopped at t={:.3}s", self.sim_time());
        }
    }

    pub fn set_pacing(&mut self, pacing: Pacing) -> Result<(), ClockError> {
        if !pacing.is_valid(self.time.step()) {
            return Err(SimError::Configuration(format!("invalid pacing {pacing:?}")).into());
        }
        self.config.pacing = pacing;
        self.time.reanchor(Instant::now());
        Ok(())
    }

    /// Queue a command for the next tick boundary. Values are corrected or
    /// rejected here so nothing invalid ever reaches the model.
    pub fn submit(&mut self, command: Command) -> Result<(), ClockError> {
        if matches!(self.state, ClockState::Stopped | ClockState::Faulted) {
            warn!("ignoring `{command}`: clock is {}", self.state);
            return Ok(());
        }
        let command = command.sanitized()?;
        self.pending.push_back(command);
        Ok(())
    }

    pub fn set_valve_position(&mut self, position: f64) -> Result<(), ClockError> {
        self.submit(Command::SetValvePosition(position))
    }

    pub fn set_pid_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), ClockError> {
        self.submit(Command::SetPidGains { kp, ki, kd })
    }

    pub fn set_setpoint(&mut self, setpoint: f64) -> Result<(), ClockError> {
        self.submit(Command::SetSetpoint(setpoint))
    }

    pub fn select_mode(&mut self, mode: Mode) -> Result<(), ClockError> {
        self.submit(Command::SelectMode(mode))
    }

    fn apply(&mut self, command: Command) {
        let result = match command {
            Command::SetValvePosition(v) => self.law.set_valve_position(v).map(|_| ()),
            Command::SetPidGains { kp, ki, kd } => self.law.set_pid_gains(kp, ki, kd),
            Command::SetSetpoint(t) => self.law.set_setpoint(t).map(|_| ()),
            Command::SelectMode(mode) => {
                self.law.select(mode);
                Ok(())
            }
            Command::Stop => {
                self.stop();
                Ok(())
            }
        };
        match result {
            Ok(()) => info!("t={:.3}s applied `{command}`", self.sim_time()),
            Err(e) => warn!("t={:.3}s rejected `{command}`: {e}", self.sim_time()),
        }
    }

    /// Wait before the next tick is due under the configured pacing.
    pub fn delay_until_due(&self, now: Instant) -> Duration {
        self.time.delay_until_due(&self.config.pacing, now)
    }

    pub fn tick<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> Result<TickOutcome, ClockError> {
        self.tick_at(Instant::now(), sink)
    }

    /// One step: apply queued commands, read the controller, integrate,
    /// advance time, report.
    pub fn tick_at<S: SampleSink + ?Sized>(
        &mut self,
        now: Instant,
        sink: &mut S,
    ) -> Result<TickOutcome, ClockError> {
        if self.state != ClockState::Running {
            return Ok(TickOutcome::Inactive(self.state));
        }

        while let Some(command) = self.pending.pop_front() {
            self.apply(command);
            if self.state != ClockState::Running {
                return Ok(TickOutcome::Inactive(self.state));
            }
        }

        let dt = self.time.step();
        let av = self
            .law
            .compute_valve_position(self.reactor.reactor_temp, dt);

        let next = match integrate(&self.reactor, av, &self.params, dt, &self.config.solver) {
            Ok(next) => next,
            Err(e) => {
                error!("simulation faulted at t={:.3}s: {e}", self.sim_time());
                self.state = ClockState::Faulted;
                self.pending.clear();
                self.fault = Some(e.clone());
                return Err(e.into());
            }
        };

        self.reactor = next;
        if self.time.advance(&self.config.pacing, now) {
            warn!(
                "t={:.3}s: running behind real time, pacing re-anchored",
                self.sim_time()
            );
        }

        let sample = Sample {
            time: self.sim_time(),
            reactor_temp: next.reactor_temp,
            jacket_temp: next.jacket_temp,
            valve_position: av,
            setpoint: self.law.setpoint(),
        };
        sink.record(&sample);
        Ok(TickOutcome::Advanced(sample))
    }

    /// Blocking loop for headless runs. Sleeps between ticks according to
    /// the pacing; `horizon` ends the run once that much time is simulated.
    pub fn run<S, C>(
        &mut self,
        sink: &mut S,
        source: &mut C,
        horizon: Option<f64>,
    ) -> Result<RunOutcome, ClockError>
    where
        S: SampleSink + ?Sized,
        C: CommandSource + ?Sized,
    {
        if self.state == ClockState::Idle {
            self.start()?;
        }

        while self.state == ClockState::Running {
            for command in source.poll(self.sim_time()) {
                if let Err(e) = self.submit(command) {
                    warn!("dropping scheduled `{command}`: {e}");
                }
            }
            if let Some(h) = horizon {
                if self.sim_time() + 0.5 * self.time.step() > h {
                    self.stop();
                    break;
                }
            }

            let delay = self.delay_until_due(Instant::now());
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            match self.tick(sink) {
                Ok(_) => {}
                Err(ClockError::Sim(e)) => return Ok(RunOutcome::Faulted(e)),
                Err(e) => return Err(e),
            }
        }

        Ok(match &self.fault {
            Some(e) => RunOutcome::Faulted(e.clone()),
            None => RunOutcome::Stopped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller::PidConfig;

    fn manual_clock(av: f64) -> SimulationClock {
        SimulationClock::new(
            PhysicalParameters::default(),
            ReactorState::default(),
            ControlLaw::manual(av),
            ClockConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn idle_clock_does_not_tick() {
        let mut clock = manual_clock(0.4);
        let mut out: Vec<Sample> = Vec::new();
        assert_eq!(
            clock.tick(&mut out).unwrap(),
            TickOutcome::Inactive(ClockState::Idle)
        );
        assert!(out.is_empty());
        assert_eq!(clock.sim_time(), 0.0);
    }

    #[test]
    fn start_only_from_idle() {
        let mut clock = manual_clock(0.4);
        clock.start().unwrap();
        assert!(matches!(
            clock.start(),
            Err(ClockError::NotIdle(ClockState::Running))
        ));
    }

    #[test]
    fn each_tick_advances_exactly_one_step() {
        let mut clock = manual_clock(0.433255);
        clock.start().unwrap();
        let mut out = Vec::new();
        for _ in 0..5 {
            clock.tick(&mut out).unwrap();
        }
        let times: Vec<f64> = out.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(out.iter().all(|s| s.setpoint.is_none()));
    }

    #[test]
    fn commands_apply_at_the_next_tick() {
        let mut clock = manual_clock(0.4);
        clock.start().unwrap();
        clock.set_valve_position(0.9).unwrap();
        assert_eq!(clock.control().valve_position(), 0.4);
        assert_eq!(clock.pending(), 1);

        let mut out = Vec::new();
        clock.tick(&mut out).unwrap();
        assert_eq!(out[0].valve_position, 0.9);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn out_of_range_valve_is_clamped_at_the_boundary() {
        let mut clock = manual_clock(0.4);
        clock.start().unwrap();
        clock.set_valve_position(3.0).unwrap();
        assert!(matches!(
            clock.set_valve_position(f64::NAN),
            Err(ClockError::Input(_))
        ));
        let mut out = Vec::new();
        clock.tick(&mut out).unwrap();
        assert_eq!(out[0].valve_position, 1.0);
    }

    #[test]
    fn queued_stop_halts_before_integrating() {
        let mut clock = manual_clock(0.4);
        clock.start().unwrap();
        clock.submit(Command::Stop).unwrap();
        let mut out = Vec::new();
        assert_eq!(
            clock.tick(&mut out).unwrap(),
            TickOutcome::Inactive(ClockState::Stopped)
        );
        assert!(out.is_empty());
        assert_eq!(clock.state(), ClockState::Stopped);
    }

    #[test]
    fn pid_samples_carry_the_setpoint() {
        let mut clock = SimulationClock::new(
            PhysicalParameters::default(),
            ReactorState::default(),
            ControlLaw::pid(PidConfig::default(), 0.433255),
            ClockConfig::default(),
        )
        .unwrap();
        clock.start().unwrap();
        clock.set_setpoint(29.0).unwrap();
        let mut out = Vec::new();
        clock.tick(&mut out).unwrap();
        assert_eq!(out[0].setpoint, Some(29.0));
    }

    #[test]
    fn bad_configuration_fails_at_construction() {
        let params = PhysicalParameters {
            density: 0.0,
            ..Default::default()
        };
        let r = SimulationClock::new(
            params,
            ReactorState::default(),
            ControlLaw::manual(0.5),
            ClockConfig::default(),
        );
        assert!(matches!(r, Err(SimError::Configuration(_))));

        let r = SimulationClock::new(
            PhysicalParameters::default(),
            ReactorState::default(),
            ControlLaw::manual(0.5),
            ClockConfig {
                step: 0.0,
                ..Default::default()
            },
        );
        assert!(matches!(r, Err(SimError::Configuration(_))));
    }

    #[test]
    fn configured_negative_gain_never_reaches_the_loop() {
        let cfg = PidConfig {
            kp: -5.0,
            ..Default::default()
        };
        let clock = SimulationClock::new(
            PhysicalParameters::default(),
            ReactorState::default(),
            ControlLaw::pid(cfg, 0.4),
            ClockConfig::default(),
        )
        .unwrap();
        assert_eq!(clock.control().pid_controller().config().kp, 0.0);
    }

    #[test]
    fn tiny_realtime_ratio_is_rejected() {
        let config = ClockConfig {
            pacing: Pacing::RealTime { ratio: 1e-30 },
            ..Default::default()
        };
        let r = SimulationClock::new(
            PhysicalParameters::default(),
            ReactorState::default(),
            ControlLaw::manual(0.4),
            config,
        );
        assert!(matches!(r, Err(SimError::Configuration(_))));

        let mut clock = manual_clock(0.4);
        clock.start().unwrap();
        assert!(clock.set_pacing(Pacing::RealTime { ratio: 1e-30 }).is_err());
        assert_eq!(clock.config().pacing, Pacing::Unpaced);
        assert_eq!(clock.delay_until_due(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn run_until_horizon_then_stop() {
        let mut clock = SimulationClock::new(
            PhysicalParameters::default(),
            ReactorState::default(),
            ControlLaw::manual(0.433255),
            ClockConfig {
                step: 0.1,
                ..Default::default()
            },
        )
        .unwrap();
        let mut out = Vec::new();
        let outcome = clock.run(&mut out, &mut NoCommands, Some(2.0)).unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(out.len(), 20);
        assert_eq!(clock.state(), ClockState::Stopped);
    }

    #[test]
    fn scripted_stop_ends_run() {
        let mut clock = manual_clock(0.433255);
        let mut script = ScheduledCommands::new(vec!["5:stop".parse().unwrap()]);
        let mut out = Vec::new();
        let outcome = clock.run(&mut out, &mut script, None).unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(out.len(), 5);
    }
}
