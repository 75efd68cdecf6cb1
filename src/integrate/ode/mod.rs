//! Stiff ordinary differential equation (ODE) solvers.
//!
//! This module provides the configuration types shared by the forward,
//! forward-sensitivity and adjoint solvers. The solvers themselves live in
//! [`impl_generic::ode`](crate::integrate::impl_generic::ode) and the
//! sensitivity module.
//!
//! # Usage
//!
//! ```ignore
//! use stiffsens::integrate::{ForwardSolver, SolverOptions};
//!
//! let options = SolverOptions::with_tolerances(1e-8, 1e-8).max_steps(1000);
//! let mut solver = ForwardSolver::new(problem, options)?;
//! let trajectory = solver.solve(0.0, &[0.5, 1.0, 2.0], &[1.0])?;
//! ```

mod types;

pub use types::{SolverOptions, Tolerance};

pub(crate) use types::validate_tolerance_pair;
