use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// One reading per tick, handed to whoever displays the run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "t_s")]
    pub time: f64,
    #[serde(rename = "reactor_temp_c")]
    pub reactor_temp: f64,
    #[serde(rename = "jacket_temp_c")]
    pub jacket_temp: f64,
    #[serde(rename = "valve")]
    pub valve_position: f64,
    /// Present while the PID loop is closed.
    #[serde(rename = "setpoint_c", default, skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
}

impl Sample {
    pub fn is_finite(&self) -> bool {
        self.time.is_finite()
            && self.reactor_temp.is_finite()
            && self.jacket_temp.is_finite()
            && self.valve_position.is_finite()
            && self.setpoint.map_or(true, f64::is_finite)
    }
}

pub trait SampleSink {
    fn record(&mut self, sample: &Sample);
}

impl SampleSink for Vec<Sample> {
    fn record(&mut self, sample: &Sample) {
        self.push(*sample);
    }
}

impl<S: SampleSink + ?Sized> SampleSink for &mut S {
    fn record(&mut self, sample: &Sample) {
        (**self).record(sample);
    }
}

/// Trailing history covering the last `span` simulated seconds.
#[derive(Clone, Debug)]
pub struct TraceWindow {
    span: f64,
    samples: VecDeque<Sample>,
}

impl TraceWindow {
    pub fn new(span: f64) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// `[start, end]` of the visible time axis; starts at zero until the window fills.
    pub fn time_range(&self) -> (f64, f64) {
        let end = self.last().map_or(0.0, |s| s.time).max(self.span);
        (end - self.span, end)
    }
}

impl SampleSink for TraceWindow {
    fn record(&mut self, sample: &Sample) {
        self.samples.push_back(*sample);
        let cutoff = sample.time - self.span;
        while self.samples.front().is_some_and(|s| s.time < cutoff) {
            self.samples.pop_front();
        }
    }
}
