use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How ticks are spread over wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pacing {
    /// Tick as fast as the caller asks.
    Unpaced,
    /// `ratio` simulated seconds per real second.
    RealTime { ratio: f64 },
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Unpaced
    }
}

impl Pacing {
    /// A real-time ratio must be positive and turn one `step` into a
    /// representable wall-clock period.
    pub fn is_valid(&self, step: f64) -> bool {
        match *self {
            Pacing::Unpaced => true,
            Pacing::RealTime { ratio } => {
                ratio.is_finite()
                    && ratio > 0.0
                    && Duration::try_from_secs_f64(step / ratio).is_ok()
            }
        }
    }

    /// Real time one tick of `step` simulated seconds should take.
    pub fn period(&self, step: f64) -> Option<Duration> {
        match *self {
            Pacing::Unpaced => None,
            Pacing::RealTime { ratio } => Some(to_duration(step / ratio)),
        }
    }
}

fn to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Simulated time, counted in whole ticks so it never drifts from `ticks * step`.
#[derive(Clone, Debug)]
pub struct TimeBase {
    step: f64,
    ticks: u64,
    /// Real instant matched to a simulated time; pacing is measured from here.
    anchor: Option<(Instant, f64)>,
}

impl TimeBase {
    pub fn new(step: f64) -> Self {
        Self {
            step,
            ticks: 0,
            anchor: None,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn sim_time(&self) -> f64 {
        self.ticks as f64 * self.step
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.anchor = Some((now, self.sim_time()));
    }

    pub(crate) fn reanchor(&mut self, now: Instant) {
        if self.anchor.is_some() {
            self.anchor = Some((now, self.sim_time()));
        }
    }

    /// Anchor instant and how long after it `sim_time` is due.
    fn due(&self, sim_time: f64, ratio: f64) -> Option<(Instant, Duration)> {
        self.anchor
            .map(|(at, anchor_sim)| (at, to_duration((sim_time - anchor_sim) / ratio)))
    }

    /// Wait before the next tick may run.
    pub fn delay_until_due(&self, pacing: &Pacing, now: Instant) -> Duration {
        match *pacing {
            Pacing::Unpaced => Duration::ZERO,
            Pacing::RealTime { ratio } => self
                .due(self.sim_time() + self.step, ratio)
                .map(|(at, offset)| offset.saturating_sub(now.saturating_duration_since(at)))
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Count one tick finished at `now`. Returns true when the tick landed
    /// more than a full period late and the backlog was dropped.
    pub(crate) fn advance(&mut self, pacing: &Pacing, now: Instant) -> bool {
        self.ticks += 1;
        let (Pacing::RealTime { ratio }, Some(period)) = (*pacing, pacing.period(self.step)) else {
            return false;
        };
        let Some((at, offset)) = self.due(self.sim_time(), ratio) else {
            return false;
        };
        let late = now.saturating_duration_since(at).saturating_sub(offset);
        if late > period {
            self.anchor = Some((now, self.sim_time()));
            return true;
        }
        false
    }
}
