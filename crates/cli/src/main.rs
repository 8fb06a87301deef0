use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use clock::{
    ClockConfig, Pacing, RunOutcome, Sample, SampleSink, ScheduledCommand, ScheduledCommands,
    SimulationClock,
};
use controller::{Action, ControlLaw, Mode, PidConfig};
use log::{error, info};
use sim::{PhysicalParameters, ReactorState};

#[derive(Clone, Debug, ValueEnum)]
enum ModeArg {
    Manual,
    Pid,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Manual => Mode::Manual,
            ModeArg::Pid => Mode::Pid,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "reactor-thermal-sim",
    version,
    about = "Stirred-tank reactor temperature control simulation (manual valve or PID)"
)]
struct Args {
    #[arg(value_enum, long, default_value = "manual")]
    mode: ModeArg,

    /// Total simulated time in seconds
    #[arg(long, default_value_t = 1000.0)]
    seconds: f64,

    /// Fixed time step in seconds
    #[arg(long, default_value_t = 1.0)]
    dt: f64,

    /// Pace the run against the wall clock
    #[arg(long)]
    realtime: bool,

    /// Simulated seconds per real second when --realtime is set
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Initial valve position (0..1)
    #[arg(long, default_value_t = 0.433255)]
    valve: f64,

    #[arg(long, default_value_t = 0.05)]
    kp: f64,

    #[arg(long, default_value_t = 0.001)]
    ki: f64,

    #[arg(long, default_value_t = 0.5)]
    kd: f64,

    /// Reactor temperature setpoint (°C)
    #[arg(long, default_value_t = 31.0)]
    setpoint: f64,

    /// Lower bound on the PID integral (anti-windup)
    #[arg(long)]
    integral_min: Option<f64>,

    /// Upper bound on the PID integral (anti-windup)
    #[arg(long)]
    integral_max: Option<f64>,

    /// Opening the valve cools the reactor (coolant-only jacket)
    #[arg(long)]
    reverse_acting: bool,

    /// Initial reactor temperature (°C)
    #[arg(long, default_value_t = 31.0)]
    t0: f64,

    /// Initial jacket temperature (°C)
    #[arg(long, default_value_t = 47.7322203151538)]
    tj0: f64,

    /// JSON file with physical parameters; missing fields keep their defaults
    #[arg(long)]
    params: Option<PathBuf>,

    /// Scheduled operator command, e.g. `120:setpoint=28`, `300:valve=0.2`,
    /// `10:gains=2,0.1,0.5`, `0:mode=pid`, `900:stop`
    #[arg(long = "at", value_name = "AT:COMMAND")]
    at: Vec<ScheduledCommand>,
}

/// Streams samples as JSON Lines; the first write error is kept and reported at the end.
struct JsonLines<W: Write> {
    out: W,
    flush_each: bool,
    error: Option<anyhow::Error>,
}

impl<W: Write> JsonLines<W> {
    fn new(out: W, flush_each: bool) -> Self {
        Self {
            out,
            flush_each,
            error: None,
        }
    }

    fn write(&mut self, sample: &Sample) -> Result<()> {
        serde_json::to_writer(&mut self.out, sample)?;
        writeln!(self.out)?;
        if self.flush_each {
            self.out.flush()?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e.context("failed to write trace"));
        }
        self.out.flush().context("failed to flush trace")
    }
}

impl<W: Write> SampleSink for JsonLines<W> {
    fn record(&mut self, sample: &Sample) {
        if self.error.is_none() {
            if let Err(e) = self.write(sample) {
                self.error = Some(e);
            }
        }
    }
}

fn load_params(path: Option<&Path>) -> Result<PhysicalParameters> {
    let Some(path) = path else {
        return Ok(PhysicalParameters::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid parameters in {}", path.display()))
}

fn pid_config(args: &Args) -> PidConfig {
    let integral_limits = match (args.integral_min, args.integral_max) {
        (None, None) => None,
        (min, max) => Some((min.unwrap_or(f64::MIN), max.unwrap_or(f64::MAX))),
    };
    PidConfig {
        kp: args.kp,
        ki: args.ki,
        kd: args.kd,
        setpoint: args.setpoint,
        action: if args.reverse_acting {
            Action::Reverse
        } else {
            Action::Direct
        },
        integral_limits,
        ..Default::default()
    }
}

/// 0 when the run stopped or hit the horizon, 2 when the simulation faulted.
fn exit_status(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Stopped => 0,
        RunOutcome::Faulted(_) => 2,
    }
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let params = load_params(args.params.as_deref())?;
    let initial = ReactorState {
        reactor_temp: args.t0,
        jacket_temp: args.tj0,
    };
    let law = ControlLaw::new(args.mode.clone().into(), args.valve, pid_config(&args));
    let config = ClockConfig {
        step: args.dt,
        pacing: if args.realtime {
            Pacing::RealTime { ratio: args.speed }
        } else {
            Pacing::Unpaced
        },
        ..Default::default()
    };

    let mut clock =
        SimulationClock::new(params, initial, law, config).context("invalid configuration")?;

    let stdout = io::stdout().lock();
    let mut trace = JsonLines::new(BufWriter::new(stdout), args.realtime);
    let mut script = ScheduledCommands::new(args.at);

    let outcome = clock.run(&mut trace, &mut script, Some(args.seconds))?;
    trace.finish()?;

    match &outcome {
        RunOutcome::Stopped => info!(
            "finished: t={:.1}s T={:.3} Tj={:.3}",
            clock.sim_time(),
            clock.reactor().reactor_temp,
            clock.reactor().jacket_temp
        ),
        RunOutcome::Faulted(e) => {
            error!("run aborted: {e}");
            eprintln!("simulation faulted at t={:.3}s: {e}", clock.sim_time());
        }
    }
    Ok(ExitCode::from(exit_status(&outcome)))
}
