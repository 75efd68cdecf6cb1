//! Forward and adjoint sensitivity analysis.
//!
//! For `dy/dt = f(t, y, p)` observed at output times `t_i`, two routes to
//! derivatives are provided:
//!
//! - [`SensitivitySolver`] integrates `∂y/∂p` alongside the state. The cost
//!   grows with the number of differentiable parameters.
//! - [`AdjointSolver`] computes the gradient of `L = Σ_i g_i · y(t_i)` with a
//!   checkpointed forward pass and one backward pass. The cost is roughly
//!   independent of the number of parameters.
//!
//! [`AdjointOp`] and [`ForwardSensitivityOp`] wrap the solvers for callers
//! that pass numr tensors by value.
//!
//! # Example
//!
//! ```ignore
//! let options = AdjointOptions::default();
//! let mut solver = AdjointSolver::new(problem, SolverOptions::default(), options)?;
//! let traj = solver.solve_forward(0.0, &tvals, &y0)?;
//! let sol = solver.solve_backward(0.0, tvals[tvals.len() - 1], &tvals, &grads)?;
//! let dl_dp = sol.grad_params;
//! let dl_dy0 = sol.grad_y0();
//! ```

pub mod impl_generic;
pub mod op;
pub mod traits;

pub use impl_generic::{AdjointSolver, SensitivitySolver};
pub use op::{AdjointGradients, AdjointOp, ForwardSensitivityOp};
pub use traits::{
    AdjointOptions, AdjointPhase, BackwardSolution, Interpolation, SensitivityMethod,
    SensitivityOptions,
};
