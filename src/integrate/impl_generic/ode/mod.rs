//! Bundled integration engine and the forward solver built on it.
//!
//! [`SdirkEngine`] advances the state with TR-BDF2 and solves its Newton
//! systems through numr. [`ForwardSolver`] drives any
//! [`IntegrationEngine`](crate::integrate::traits::IntegrationEngine) across
//! a grid of output times.

mod engine;
mod forward;
pub mod jacobian;
mod linear;
mod step_control;
mod systems;
mod tr_bdf2;
mod trajectory;

pub use engine::SdirkEngine;
pub use forward::ForwardSolver;
pub use linear::{DenseLinearSolver, IterationMatrix};
pub use trajectory::{SensitivityTrajectory, Trajectory};
pub(crate) use trajectory::tensor_values;

pub(crate) use forward::{step_until, validate_time_grid};
