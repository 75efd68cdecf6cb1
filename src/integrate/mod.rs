//! Stiff ODE integration with forward and adjoint sensitivities.
//!
//! # Layout
//!
//! - [`traits`] - [`OdeProblem`] (what to integrate) and the engine traits
//!   (how a stepper is driven)
//! - [`impl_generic::ode`] - the bundled TR-BDF2 engine and [`ForwardSolver`]
//! - [`sensitivity`] - [`SensitivitySolver`], [`AdjointSolver`] and the
//!   value-semantics operators
//! - [`ode`] - [`SolverOptions`] and tolerances
//!
//! # Example
//!
//! ```ignore
//! use stiffsens::integrate::{ForwardSolver, SolverOptions};
//!
//! let mut solver = ForwardSolver::new(problem, SolverOptions::with_tolerances(1e-8, 1e-10))?;
//! let traj = solver.solve(0.0, &[0.0, 1.0, 10.0], &[1.0, 0.0])?;
//! ```

pub mod error;
pub mod impl_generic;
pub mod ode;
pub mod sensitivity;
#[cfg(test)]
pub(crate) mod test_problems;
pub mod traits;

pub use error::{IntegrateError, IntegrateResult};
pub use impl_generic::ode::{ForwardSolver, SdirkEngine, SensitivityTrajectory, Trajectory};
pub use ode::{SolverOptions, Tolerance};
pub use sensitivity::{
    AdjointGradients, AdjointOp, AdjointOptions, AdjointPhase, AdjointSolver, BackwardSolution,
    ForwardSensitivityOp, Interpolation, SensitivityMethod, SensitivityOptions, SensitivitySolver,
};
pub use traits::{
    AdTensor, AdjointEngine, EngineFlag, EngineStats, IntegrationEngine, OdeProblem,
    SensitivityEngine, StepStatus,
};
