//! stiffsens - Stiff ODE solutions with parameter gradients
//!
//! stiffsens integrates stiff ordinary differential equations
//! `dy/dt = f(t, y, p)` and differentiates the solution with respect to the
//! parameters `p` and the initial state. Linear algebra and the derivatives
//! of `f` run on numr; the operators take and return numr tensors.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   AdjointOp / ForwardSensitivityOp  (value semantics)   │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ drives
//! ┌──────────────────────────▼──────────────────────────────┐
//! │   ForwardSolver / SensitivitySolver / AdjointSolver     │
//! │          (time grids, phases, retry policy)             │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ steps
//! ┌──────────────────────────▼──────────────────────────────┐
//! │      SdirkEngine (TR-BDF2, checkpoints, quadrature)     │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ uses
//! ┌──────────────────────────▼──────────────────────────────┐
//! │        numr (dense linear solves, forward/reverse AD)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`integrate`] - problems, the integration engine and the three solvers
//! - [`params`] - named parameter trees and the differentiable subset
//!
//! # Choosing a solver
//!
//! | Need | Solver |
//! |------|--------|
//! | States at output times | [`ForwardSolver`] |
//! | Full Jacobian `∂y(t_i)/∂p`, few parameters | [`SensitivitySolver`] |
//! | Gradient of a scalar loss, many parameters | [`AdjointSolver`] |
//!
//! # Example
//!
//! ```ignore
//! use stiffsens::{AdjointOp, AdjointOptions, AdjointSolver, CpuDevice, CpuRuntime};
//! use stiffsens::{SolverOptions, Tensor};
//!
//! let device = CpuDevice::new();
//! let solver = AdjointSolver::new(problem, SolverOptions::default(), AdjointOptions::default())?;
//! let mut op = AdjointOp::new(solver, 0.0, vec![1.0, 2.0, 5.0])?;
//!
//! let y0 = Tensor::<CpuRuntime>::from_slice(&[1.0, 0.0], &[2], &device);
//! let params = Tensor::<CpuRuntime>::from_slice(&[0.5, 2.0], &[2], &device);
//! let fixed = Tensor::<CpuRuntime>::from_slice(&[0.1], &[1], &device);
//!
//! let states = op.forward(&y0, &params, &fixed)?; // [3, 2]
//! let grads = loss_gradient(&states)?; // [3, 2]
//! let dl = op.backward(&y0, &params, &fixed, &grads)?;
//! println!("dL/dp = {:?}", dl.params.to_vec::<f64>());
//! ```

pub mod integrate;
pub mod params;

// Re-export main types for convenience
pub use integrate::{
    AdTensor, AdjointGradients, AdjointOp, AdjointOptions, AdjointPhase, AdjointSolver,
    BackwardSolution, ForwardSensitivityOp, ForwardSolver, IntegrateError, IntegrateResult,
    Interpolation, OdeProblem, SdirkEngine, SensitivityMethod, SensitivityOptions,
    SensitivitySolver, SensitivityTrajectory, SolverOptions, Tolerance, Trajectory,
};
pub use params::{ParamAccess, ParamLeaf, ParamSpace, ParamTree};

// Re-export numr types that users will commonly need
pub use numr::runtime::cpu::{CpuDevice, CpuRuntime};
pub use numr::tensor::Tensor;
