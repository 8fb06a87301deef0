use thiserror::Error;

/// Why an adaptive integration step gave up.
#[derive(Clone, Copy, Debug, PartialEq, Error)]
pub enum IntegrationFailure {
    #[error("derivative evaluated to a non-finite value")]
    NonFiniteDerivative,

    #[error("state became non-finite")]
    NonFiniteState,

    #[error("step size underflow (h = {h:e})")]
    StepSizeUnderflow { h: f64 },

    #[error("exceeded {limit} internal steps")]
    TooManySteps { limit: usize },
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("integration failed at t = {t:.6} within the step: {failure}")]
    Integration { t: f64, failure: IntegrationFailure },
}

pub type SimResult<T> = Result<T, SimError>;
