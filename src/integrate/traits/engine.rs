//! Interface between the solvers and a stateful integration engine.
//!
//! The solvers only ever talk to an engine through these traits. An engine
//! owns its state, step-size history and (for adjoint engines) checkpoint
//! storage. Every stepping call receives the problem and the parameter buffer
//! by shared borrow, so the buffer outlives each call by construction.

use std::fmt;

use super::problem::OdeProblem;
use crate::integrate::error::IntegrateResult;
use crate::integrate::sensitivity::{AdjointOptions, SensitivityOptions};

/// Outcome of one step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Target time reached.
    Success,
    /// Work limit for this request exhausted; the engine state is valid and
    /// the same request may be repeated.
    TooMuchWork,
    /// Non-retryable failure.
    Failed(EngineFlag),
}

/// Non-retryable engine failure conditions with CVODE-style codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineFlag {
    /// Error test failed repeatedly or with the minimum step size.
    ErrFailure,
    /// Newton iteration failed repeatedly or with the minimum step size.
    ConvFailure,
    /// The linear solver could not solve the Newton system.
    LinearSolveFailure,
    /// The right-hand side or one of its derivatives failed.
    RhsFailure,
    /// Sign constraints could not be satisfied.
    ConstraintFailure,
    /// Invalid arguments to the engine.
    IllInput,
    /// Target time lies in the wrong direction or outside the stored
    /// trajectory.
    BadTime,
    /// Backward integration requested without a completed forward pass.
    NoForwardData,
}

impl EngineFlag {
    /// Symbolic name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ErrFailure => "CV_ERR_FAILURE",
            Self::ConvFailure => "CV_CONV_FAILURE",
            Self::LinearSolveFailure => "CV_LSOLVE_FAIL",
            Self::RhsFailure => "CV_RHSFUNC_FAIL",
            Self::ConstraintFailure => "CV_CONSTR_FAIL",
            Self::IllInput => "CV_ILL_INPUT",
            Self::BadTime => "CV_BAD_T",
            Self::NoForwardData => "CV_NO_FWD",
        }
    }

    /// Integer return code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ErrFailure => -3,
            Self::ConvFailure => -4,
            Self::LinearSolveFailure => -7,
            Self::RhsFailure => -8,
            Self::ConstraintFailure => -15,
            Self::IllInput => -22,
            Self::BadTime => -25,
            Self::NoForwardData => -103,
        }
    }
}

impl fmt::Display for EngineFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Counters accumulated by an engine since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Accepted forward steps.
    pub n_steps: usize,
    /// Right-hand side evaluations.
    pub n_rhs_evals: usize,
    /// Jacobian evaluations.
    pub n_jac_evals: usize,
    /// Linear solves with the iteration matrix.
    pub n_linear_solves: usize,
    /// Steps rejected by the error test.
    pub n_error_test_failures: usize,
    /// Steps rejected because Newton did not converge.
    pub n_newton_failures: usize,
    /// Accepted backward steps.
    pub n_backward_steps: usize,
    /// Checkpoint intervals recomputed during backward passes.
    pub n_recomputed_windows: usize,
}

/// A stateful integrator for `dy/dt = f(t, y, p)`.
pub trait IntegrationEngine {
    /// Number of states this engine was built for.
    fn n_states(&self) -> usize;

    /// Restart from `(t0, y0)`, discarding all step history.
    fn reinit(&mut self, t0: f64, y0: &[f64]) -> IntegrateResult<()>;

    /// Advance the state towards `tout`.
    fn step<P: OdeProblem + ?Sized>(&mut self, problem: &P, user_data: &[f64], tout: f64)
        -> StepStatus;

    /// Current time.
    fn time(&self) -> f64;

    /// Current state.
    fn state(&self) -> &[f64];

    fn stats(&self) -> EngineStats;
}

/// An engine that also integrates forward sensitivities `dy/dp`.
pub trait SensitivityEngine: IntegrationEngine {
    /// Enable sensitivities with respect to `n_params` parameters.
    fn sens_init(&mut self, n_params: usize, options: &SensitivityOptions) -> IntegrateResult<()>;

    /// Reset sensitivities. Layout is `n_params` blocks of `n_states`.
    fn sens_reinit(&mut self, sens0: &[f64]) -> IntegrateResult<()>;

    /// Current sensitivities, same layout as in [`sens_reinit`](Self::sens_reinit).
    fn sensitivities(&self) -> &[f64];
}

/// An engine supporting a checkpointed forward pass followed by backward
/// adjoint and quadrature integration.
pub trait AdjointEngine: IntegrationEngine {
    /// Enable checkpointing and configure the backward problem.
    fn adj_init(&mut self, n_params: usize, options: &AdjointOptions) -> IntegrateResult<()>;

    /// Drop stored checkpoints and start a new forward pass at the current
    /// state.
    fn adj_reinit(&mut self) -> IntegrateResult<()>;

    /// Like [`step`](IntegrationEngine::step), storing checkpoints.
    fn step_checkpointed<P: OdeProblem + ?Sized>(
        &mut self,
        problem: &P,
        user_data: &[f64],
        tout: f64,
    ) -> StepStatus;

    /// Restart the backward problem at `t_upper` with adjoint `lambda`.
    fn backward_reinit(&mut self, t_upper: f64, lambda: &[f64]) -> IntegrateResult<()>;

    /// Restart the quadrature with `quad`.
    fn quad_reinit(&mut self, quad: &[f64]) -> IntegrateResult<()>;

    /// Integrate adjoint and quadrature backward towards `t_lower`.
    fn step_backward<P: OdeProblem + ?Sized>(
        &mut self,
        problem: &P,
        user_data: &[f64],
        t_lower: f64,
    ) -> StepStatus;

    fn backward_time(&self) -> f64;

    fn backward_state(&self) -> &[f64];

    fn backward_quad(&self) -> &[f64];
}
