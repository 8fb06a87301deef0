use std::cell::Cell;
use std::fs;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clock::{ClockConfig, ClockState, Pacing, Sample, SimulationClock, TraceWindow};
use controller::{ControlLaw, Mode, PidConfig};
use eframe::egui;
use egui_plot::{Legend, Line, LineStyle, Plot, PlotPoints};
use sim::{PhysicalParameters, ReactorState};

/// Seconds of history kept on screen.
const WINDOW_S: f64 = 1000.0;
const INITIAL_VALVE: f64 = 0.433255;

struct PidForm {
    kp: String,
    ki: String,
    kd: String,
    setpoint: String,
}

impl PidForm {
    fn from_config(cfg: &PidConfig) -> Self {
        Self {
            kp: cfg.kp.to_string(),
            ki: cfg.ki.to_string(),
            kd: cfg.kd.to_string(),
            setpoint: cfg.setpoint.to_string(),
        }
    }

    fn parse(&self) -> Result<(f64, f64, f64, f64), String> {
        let field = |label: &str, text: &str| {
            text.trim()
                .parse::<f64>()
                .map_err(|_| format!("{label} must be a number, got `{text}`"))
        };
        Ok((
            field("Kp", &self.kp)?,
            field("Ki", &self.ki)?,
            field("Kd", &self.kd)?,
            field("Setpoint", &self.setpoint)?,
        ))
    }
}

struct App {
    clock: SimulationClock,
    window: TraceWindow,

    // Control panel
    mode: Mode,
    valve_input: f64,
    pid_form: PidForm,
    realtime: bool,
    speed: f64,
    message: Option<String>,

    faulted: Rc<Cell<bool>>,
}

impl App {
    fn new(clock: SimulationClock, faulted: Rc<Cell<bool>>) -> Self {
        let mode = clock.control().mode();
        let valve_input = clock.control().valve_position();
        let pid_form = PidForm::from_config(clock.control().pid_controller().config());
        let (realtime, speed) = match clock.config().pacing {
            Pacing::RealTime { ratio } => (true, ratio),
            Pacing::Unpaced => (false, 1.0),
        };
        Self {
            clock,
            window: TraceWindow::new(WINDOW_S),
            mode,
            valve_input,
            pid_form,
            realtime,
            speed,
            message: None,
            faulted,
        }
    }

    fn report(&mut self, result: Result<(), clock::ClockError>) {
        if let Err(e) = result {
            self.message = Some(e.to_string());
        }
    }

    fn advance(&mut self, ctx: &egui::Context) {
        if self.clock.state() != ClockState::Running {
            return;
        }
        let now = Instant::now();
        let delay = self.clock.delay_until_due(now);
        if !delay.is_zero() {
            ctx.request_repaint_after(delay);
            return;
        }
        match self.clock.tick_at(now, &mut self.window) {
            Ok(_) => ctx.request_repaint(),
            Err(e) => {
                log::error!("{e}");
                self.message = Some(format!("Simulation faulted: {e}"));
                self.faulted.set(true);
            }
        }
    }

    fn control_panel(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.heading("Reactor Control");
        ui.separator();

        let mut mode = self.mode;
        egui::ComboBox::from_label("Mode")
            .selected_text(match mode {
                Mode::Manual => "Manual (open loop)",
                Mode::Pid => "PID",
            })
            .show_ui(ui, |ui| {
                ui.selectable_value(&mut mode, Mode::Manual, "Manual (open loop)");
                ui.selectable_value(&mut mode, Mode::Pid, "PID");
            });
        if mode != self.mode {
            self.mode = mode;
            let r = self.clock.select_mode(mode);
            self.report(r);
        }

        ui.separator();
        ui.label("Valve position");
        ui.add(egui::Slider::new(&mut self.valve_input, 0.0..=1.0).text("av"));
        ui.label(format!(
            "Current av: {:.2}",
            self.clock.control().manual_valve().position()
        ));
        if ui
            .add_enabled(self.mode == Mode::Manual, egui::Button::new("Apply"))
            .clicked()
        {
            let r = self.clock.set_valve_position(self.valve_input);
            self.report(r);
        }

        ui.separator();
        ui.label("PID Parameters");
        egui::Grid::new("pid_params").num_columns(2).show(ui, |ui| {
            for (label, text) in [
                ("Kp:", &mut self.pid_form.kp),
                ("Ki:", &mut self.pid_form.ki),
                ("Kd:", &mut self.pid_form.kd),
                ("Setpoint:", &mut self.pid_form.setpoint),
            ] {
                ui.label(label);
                ui.add(egui::TextEdit::singleline(text).desired_width(80.0));
                ui.end_row();
            }
        });
        if ui.button("Update PID").clicked() {
            match self.pid_form.parse() {
                Ok((kp, ki, kd, setpoint)) => {
                    let r = self
                        .clock
                        .set_pid_gains(kp, ki, kd)
                        .and_then(|_| self.clock.set_setpoint(setpoint));
                    self.report(r);
                }
                Err(msg) => self.message = Some(msg),
            }
        }

        ui.separator();
        let mut pacing_changed = ui.checkbox(&mut self.realtime, "Real time").changed();
        pacing_changed |= ui
            .add_enabled(
                self.realtime,
                egui::Slider::new(&mut self.speed, 0.1..=50.0)
                    .logarithmic(true)
                    .text("speed"),
            )
            .changed();
        if pacing_changed {
            let pacing = if self.realtime {
                Pacing::RealTime { ratio: self.speed }
            } else {
                Pacing::Unpaced
            };
            let r = self.clock.set_pacing(pacing);
            self.report(r);
        }

        ui.separator();
        if ui.button("Exit Program").clicked() {
            self.clock.stop();
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        ui.separator();
        match self.clock.pending() {
            0 => ui.label(format!("State: {}", self.clock.state())),
            n => ui.label(format!("State: {} ({n} queued)", self.clock.state())),
        };
        let r = self.clock.reactor();
        ui.label(format!(
            "t={:.0}s  T={:.2}°C  Tj={:.2}°C",
            self.clock.sim_time(),
            r.reactor_temp,
            r.jacket_temp
        ));
        if let Some(msg) = &self.message {
            let color = if self.clock.state() == ClockState::Faulted {
                egui::Color32::RED
            } else {
                egui::Color32::YELLOW
            };
            ui.colored_label(color, msg);
        }
    }

    fn series(&self, value: impl Fn(&Sample) -> f64) -> PlotPoints {
        self.window.iter().map(|s| [s.time, value(s)]).collect()
    }

    fn plots(&self, ui: &mut egui::Ui) {
        let (x0, x1) = self.window.time_range();
        let height = (ui.available_height() / 3.0 - 24.0).max(120.0);

        ui.label("Reactor Temperature Over Time");
        Plot::new("reactor_temp")
            .height(height)
            .legend(Legend::default())
            .include_x(x0)
            .include_x(x1)
            .include_y(10.0)
            .include_y(90.0)
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(self.series(|s| s.reactor_temp)).name("Reactor Temperature (T)"));
                let setpoint: PlotPoints = self
                    .window
                    .iter()
                    .filter_map(|s| s.setpoint.map(|sp| [s.time, sp]))
                    .collect();
                plot_ui.line(
                    Line::new(setpoint)
                        .name("Setpoint")
                        .color(egui::Color32::RED)
                        .style(LineStyle::dashed_loose()),
                );
            });

        ui.label("Jacket Temperature Over Time");
        Plot::new("jacket_temp")
            .height(height)
            .legend(Legend::default())
            .include_x(x0)
            .include_x(x1)
            .include_y(10.0)
            .include_y(90.0)
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(self.series(|s| s.jacket_temp)).name("Jacket Temperature (Tj)"));
            });

        ui.label("Valve Position Over Time");
        Plot::new("valve")
            .height(height)
            .legend(Legend::default())
            .include_x(x0)
            .include_x(x1)
            .include_y(0.0)
            .include_y(1.0)
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(self.series(|s| s.valve_position)).name("Valve Position (av)"));
            });
    }
}

impl eframe::App for App {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.advance(ctx);

        egui::SidePanel::right("controls")
            .resizable(false)
            .min_width(260.0)
            .show(ctx, |ui| self.control_panel(ui, ctx));

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.clock.state() == ClockState::Faulted {
                ui.colored_label(
                    egui::Color32::RED,
                    "Simulation faulted; plots are frozen at the last good sample.",
                );
            }
            self.plots(ui);
        });
    }
}

fn load_params() -> Result<PhysicalParameters> {
    match std::env::args().nth(1) {
        None => Ok(PhysicalParameters::default()),
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("invalid parameters in {path}"))
        }
    }
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let params = load_params()?;
    let law = ControlLaw::new(Mode::Manual, INITIAL_VALVE, PidConfig::default());
    let config = ClockConfig {
        pacing: Pacing::RealTime { ratio: 1.0 },
        ..Default::default()
    };
    let mut clock = SimulationClock::new(params, ReactorState::default(), law, config)
        .context("invalid configuration")?;
    clock.start()?;

    let faulted = Rc::new(Cell::new(false));
    let app = App::new(clock, Rc::clone(&faulted));

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Reactor Temperature Control")
            .with_inner_size([1200.0, 860.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Reactor Temperature Control",
        native_options,
        Box::new(move |_cc| Ok(Box::new(app))),
    )
    .map_err(|e| anyhow!("gui error: {e}"))?;

    Ok(if faulted.get() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}
