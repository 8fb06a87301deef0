//! Stirred-tank reactor with a cooling/heating jacket.
//!
//! The model is a pair of energy balances, one for the reactor contents and
//! one for the jacket fluid, coupled through the exchange surface. The valve
//! position `av` decides how much utility flow enters the jacket.

mod error;
mod solver;

pub use error::{IntegrationFailure, SimError, SimResult};
pub use solver::{dopri45, integrate, SolverOptions};

use serde::{Deserialize, Serialize};

/// How the valve position maps to flow into the jacket.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JacketSupply {
    /// Cold and hot streams blended by one valve: cold gets `1 - av`, hot gets `av`.
    SplitRange {
        cold_flow_max: f64,
        cold_temp: f64,
        hot_flow_max: f64,
        hot_temp: f64,
    },
    /// Single coolant stream throttled by the valve.
    Coolant { flow_max: f64, inlet_temp: f64 },
}

impl Default for JacketSupply {
    fn default() -> Self {
        JacketSupply::SplitRange {
            cold_flow_max: 120.0,
            cold_temp: 2.0,
            hot_flow_max: 180.0,
            hot_temp: 95.0,
        }
    }
}

impl JacketSupply {
    /// Enthalpy carried into the jacket per unit heat capacity, relative to
    /// the current jacket temperature (`sum F_i (T_i - Tj)`).
    fn inflow(&self, av: f64, jacket_temp: f64) -> f64 {
        match *self {
            JacketSupply::SplitRange {
                cold_flow_max,
                cold_temp,
                hot_flow_max,
                hot_temp,
            } => {
                let cold = cold_flow_max * (1.0 - av);
                let hot = hot_flow_max * av;
                cold * (cold_temp - jacket_temp) + hot * (hot_temp - jacket_temp)
            }
            JacketSupply::Coolant {
                flow_max,
                inlet_temp,
            } => flow_max * av * (inlet_temp - jacket_temp),
        }
    }
}

/// Physical constants of the plant. Fixed for the lifetime of a run.
///
/// Mass-like quantities (heat capacity, density, volumes) must be strictly
/// positive; [`derivatives`] divides by them without checking.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalParameters {
    /// J/(kg K), shared by reactor contents and jacket fluid
    pub heat_capacity: f64,
    /// kg/m^3
    pub density: f64,
    /// W/(m^2 K)
    pub heat_transfer_coeff: f64,
    /// m^2
    pub exchange_area: f64,
    /// m^3
    pub reactor_volume: f64,
    /// m^3
    pub jacket_volume: f64,
    /// kg/s through the reactor
    pub feed_flow: f64,
    pub feed_temp: f64,
    /// Constant heat released by the reaction, W
    pub reaction_heat: f64,
    pub jacket_supply: JacketSupply,
}

impl Default for PhysicalParameters {
    fn default() -> Self {
        Self {
            heat_capacity: 4181.3,
            density: 1000.0,
            heat_transfer_coeff: 15000.0,
            exchange_area: 9.596,
            reactor_volume: 3.0,
            jacket_volume: 0.5047,
            feed_flow: 40.0,
            feed_temp: 16.6,
            reaction_heat: 0.0,
            jacket_supply: JacketSupply::default(),
        }
    }
}

fn require_positive(name: &str, v: f64) -> SimResult<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(SimError::Configuration(format!(
            "{name} must be finite and > 0, got {v}"
        )))
    }
}

fn require_non_negative(name: &str, v: f64) -> SimResult<()> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(SimError::Configuration(format!(
            "{name} must be finite and >= 0, got {v}"
        )))
    }
}

fn require_finite(name: &str, v: f64) -> SimResult<()> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(SimError::Configuration(format!("{name} must be finite, got {v}")))
    }
}

impl PhysicalParameters {
    /// Startup check. Run once before the first step, never mid-run.
    pub fn validate(&self) -> SimResult<()> {
        require_positive("heat_capacity", self.heat_capacity)?;
        require_positive("density", self.density)?;
        require_positive("reactor_volume", self.reactor_volume)?;
        require_positive("jacket_volume", self.jacket_volume)?;
        require_non_negative("heat_transfer_coeff", self.heat_transfer_coeff)?;
        require_non_negative("exchange_area", self.exchange_area)?;
        require_non_negative("feed_flow", self.feed_flow)?;
        require_finite("feed_temp", self.feed_temp)?;
        require_finite("reaction_heat", self.reaction_heat)?;

        match self.jacket_supply {
            JacketSupply::SplitRange {
                cold_flow_max,
                cold_temp,
                hot_flow_max,
                hot_temp,
            } => {
                require_non_negative("cold_flow_max", cold_flow_max)?;
                require_non_negative("hot_flow_max", hot_flow_max)?;
                require_finite("cold_temp", cold_temp)?;
                require_finite("hot_temp", hot_temp)?;
            }
            JacketSupply::Coolant {
                flow_max,
                inlet_temp,
            } => {
                require_non_negative("flow_max", flow_max)?;
                require_finite("inlet_temp", inlet_temp)?;
            }
        }
        Ok(())
    }

    /// U * A, W/K
    pub fn exchange_conductance(&self) -> f64 {
        self.heat_transfer_coeff * self.exchange_area
    }

    /// rho * cp * Vt, J/K
    pub fn reactor_heat_capacity(&self) -> f64 {
        self.density * self.heat_capacity * self.reactor_volume
    }

    /// rho * cp * Vc, J/K
    pub fn jacket_heat_capacity(&self) -> f64 {
        self.density * self.heat_capacity * self.jacket_volume
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReactorState {
    pub reactor_temp: f64,
    pub jacket_temp: f64,
}

impl Default for ReactorState {
    /// Steady state of the default plant at `av = 0.433255`.
    fn default() -> Self {
        Self {
            reactor_temp: 31.0,
            jacket_temp: 47.732_220_315_153_8,
        }
    }
}

impl ReactorState {
    pub fn is_finite(&self) -> bool {
        self.reactor_temp.is_finite() && self.jacket_temp.is_finite()
    }

    pub(crate) fn to_array(self) -> [f64; 2] {
        [self.reactor_temp, self.jacket_temp]
    }

    pub(crate) fn from_array(y: [f64; 2]) -> Self {
        Self {
            reactor_temp: y[0],
            jacket_temp: y[1],
        }
    }
}

/// Time derivatives of [`ReactorState`], K/s.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Derivatives {
    pub reactor_temp: f64,
    pub jacket_temp: f64,
}

impl Derivatives {
    pub fn is_finite(&self) -> bool {
        self.reactor_temp.is_finite() && self.jacket_temp.is_finite()
    }
}

/// Energy balances of the reactor and the jacket:
///
/// dT/dt  = (F cp (Ti - T) + U A (Tj - T) + Q_rxn) / (rho cp Vt)
/// dTj/dt = (cp sum F_i (T_i - Tj) - U A (Tj - T)) / (rho cp Vc)
pub fn derivatives(state: &ReactorState, av: f64, p: &PhysicalParameters) -> Derivatives {
    let t = state.reactor_temp;
    let tj = state.jacket_temp;
    let exchange = p.exchange_conductance() * (tj - t);

    let reactor = (p.feed_flow * p.heat_capacity * (p.feed_temp - t) + exchange + p.reaction_heat)
        / p.reactor_heat_capacity();
    let jacket = (p.heat_capacity * p.jacket_supply.inflow(av, tj) - exchange)
        / p.jacket_heat_capacity();

    Derivatives {
        reactor_temp: reactor,
        jacket_temp: jacket,
    }
}
