//! Error taxonomy for the simulator core.
//!
//! Per the error handling design: only config-validation and runtime
//! causality violations are `SimError`. Unservable requests, admission
//! rejections, preemptions and horizon truncation are recovered locally and
//! expressed as data (`Phase`, counters), never as an `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("config validation failed: {0}")]
    ConfigValidation(String),

    #[error("causality violation: attempted to schedule at tick {attempted} but clock is at {now}")]
    CausalityViolation { now: u64, attempted: u64 },

    #[error("negative step duration computed: {0}")]
    NegativeStepDuration(i64),
}

pub type SimResult<T> = Result<T, SimError>;
