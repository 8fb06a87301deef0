//! Dormand-Prince 5(4) with adaptive step size control.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{derivatives, IntegrationFailure, PhysicalParameters, ReactorState, SimError, SimResult};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    /// Upper bound on attempted internal steps per call, rejected ones included.
    pub max_steps: usize,
    pub min_step: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            max_steps: 50_000,
            min_step: 1e-12,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> SimResult<()> {
        let tol_ok = |v: f64| v.is_finite() && v > 0.0;
        if !tol_ok(self.rtol) || !tol_ok(self.atol) || !tol_ok(self.min_step) {
            return Err(SimError::Configuration(format!(
                "solver tolerances must be finite and > 0 (rtol={}, atol={}, min_step={})",
                self.rtol, self.atol, self.min_step
            )));
        }
        if self.max_steps == 0 {
            return Err(SimError::Configuration("max_steps must be > 0".into()));
        }
        Ok(())
    }
}

const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

const A: [[f64; 6]; 7] = [
    [0.0; 6],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];

/// 5th order weights; the last stage is only used for the error estimate.
const B: [f64; 7] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
    0.0,
];

/// Difference between the 5th and embedded 4th order weights.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
const ERROR_EXPONENT: f64 = -1.0 / 5.0;

fn all_finite<const N: usize>(v: &[f64; N]) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn rms<const N: usize>(v: &[f64; N], scale: &[f64; N]) -> f64 {
    let sum: f64 = v.iter().zip(scale).map(|(x, s)| (x / s).powi(2)).sum();
    (sum / N as f64).sqrt()
}

fn weighted<const N: usize>(y: &[f64; N], h: f64, k: &[[f64; N]; 7], w: &[f64], stages: usize) -> [f64; N] {
    let mut out = *y;
    for (i, o) in out.iter_mut().enumerate() {
        let acc: f64 = (0..stages).map(|j| w[j] * k[j][i]).sum();
        *o += h * acc;
    }
    out
}

/// Hairer & Wanner's starting step heuristic.
fn initial_step<F, const N: usize>(f: &mut F, y: &[f64; N], f0: &[f64; N], span: f64, opts: &SolverOptions) -> f64
where
    F: FnMut(f64, &[f64; N]) -> [f64; N],
{
    let mut scale = [0.0; N];
    for (s, yi) in scale.iter_mut().zip(y) {
        *s = opts.atol + yi.abs() * opts.rtol;
    }
    let d0 = rms(y, &scale);
    let d1 = rms(f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    let h0 = h0.min(span);

    let mut y1 = *y;
    for i in 0..N {
        y1[i] += h0 * f0[i];
    }
    let f1 = f(h0, &y1);
    let mut diff = [0.0; N];
    for i in 0..N {
        diff[i] = f1[i] - f0[i];
    }
    let d2 = rms(&diff, &scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / 5.0)
    };
    (100.0 * h0).min(h1).min(span)
}

/// Integrate `y' = f(t, y)` from `t = 0` to `t = span` and return `y(span)`.
///
/// The final step is shortened so the result lands exactly on `span`.
pub fn dopri45<F, const N: usize>(mut f: F, y0: [f64; N], span: f64, opts: &SolverOptions) -> SimResult<[f64; N]>
where
    F: FnMut(f64, &[f64; N]) -> [f64; N],
{
    if !(span.is_finite() && span > 0.0) {
        return Err(SimError::Configuration(format!(
            "integration span must be finite and > 0, got {span}"
        )));
    }
    let fail = |t: f64, failure: IntegrationFailure| SimError::Integration { t, failure };

    let mut t = 0.0;
    let mut y = y0;
    if !all_finite(&y) {
        return Err(fail(t, IntegrationFailure::NonFiniteState));
    }
    let mut k1 = f(t, &y);
    if !all_finite(&k1) {
        return Err(fail(t, IntegrationFailure::NonFiniteDerivative));
    }

    let mut h = initial_step(&mut f, &y, &k1, span, opts);
    let mut attempts = 0usize;
    let mut rejected = 0usize;

    while t < span {
        if attempts >= opts.max_steps {
            return Err(fail(t, IntegrationFailure::TooManySteps { limit: opts.max_steps }));
        }
        attempts += 1;

        let last = h >= span - t;
        if last {
            h = span - t;
        } else if h < opts.min_step {
            return Err(fail(t, IntegrationFailure::StepSizeUnderflow { h }));
        }

        let mut k = [[0.0; N]; 7];
        k[0] = k1;
        for s in 1..7 {
            let ys = weighted(&y, h, &k, &A[s], s);
            k[s] = f(t + C[s] * h, &ys);
        }

        let y_new = weighted(&y, h, &k, &B, 6);
        let mut err = [0.0; N];
        let mut scale = [0.0; N];
        for i in 0..N {
            err[i] = h * (0..7).map(|j| E[j] * k[j][i]).sum::<f64>();
            scale[i] = opts.atol + opts.rtol * y[i].abs().max(y_new[i].abs());
        }
        let err_norm = rms(&err, &scale);

        if !err_norm.is_finite() || !all_finite(&y_new) || !all_finite(&k[6]) {
            // Overshot into a region where the model blows up; retry smaller.
            rejected += 1;
            h *= MIN_FACTOR;
            if h < opts.min_step {
                return Err(fail(t, IntegrationFailure::NonFiniteState));
            }
            continue;
        }

        if err_norm <= 1.0 {
            t = if last { span } else { t + h };
            y = y_new;
            k1 = k[6];
            let factor = if err_norm == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err_norm.powf(ERROR_EXPONENT)).min(MAX_FACTOR)
            };
            h *= factor;
        } else {
            rejected += 1;
            h *= (SAFETY * err_norm.powf(ERROR_EXPONENT)).max(MIN_FACTOR);
            if h < opts.min_step {
                return Err(fail(t, IntegrationFailure::StepSizeUnderflow { h }));
            }
        }
    }

    trace!("dopri45: span={span} attempts={attempts} rejected={rejected}");
    Ok(y)
}

/// Advance the reactor by `dt` with the valve held at `av` over the interval.
pub fn integrate(
    state: &ReactorState,
    av: f64,
    params: &PhysicalParameters,
    dt: f64,
    opts: &SolverOptions,
) -> SimResult<ReactorState> {
    let rhs = |_t: f64, y: &[f64; 2]| {
        let d = derivatives(&ReactorState::from_array(*y), av, params);
        [d.reactor_temp, d.jacket_temp]
    };
    let next = ReactorState::from_array(dopri45(rhs, state.to_array(), dt, opts)?);
    if !next.is_finite() {
        return Err(SimError::Integration {
            t: dt,
            failure: IntegrationFailure::NonFiniteState,
        });
    }
    Ok(next)
}
