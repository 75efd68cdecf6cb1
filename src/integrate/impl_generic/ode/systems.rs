//! Stage systems solved by the TR-BDF2 stepper.
//!
//! Each system wraps a problem callback and an iteration matrix built at the
//! start of the step. Problem errors are reported as
//! [`EngineFlag::RhsFailure`]; linear algebra errors as
//! [`EngineFlag::LinearSolveFailure`].

use super::linear::{DenseLinearSolver, IterationMatrix};
use super::tr_bdf2::StageSystem;
use crate::integrate::error::IntegrateError;
use crate::integrate::sensitivity::impl_generic::checkpointing::DenseWindow;
use crate::integrate::sensitivity::traits::Interpolation;
use crate::integrate::traits::{EngineFlag, EngineStats, OdeProblem};

pub(crate) fn rhs_failure(t: f64, err: IntegrateError) -> EngineFlag {
    log::debug!("problem callback failed at t = {}: {}", t, err);
    EngineFlag::RhsFailure
}

fn linear_failure(err: IntegrateError) -> EngineFlag {
    log::debug!("linear solve failed: {}", err);
    EngineFlag::LinearSolveFailure
}

/// Solve each length-`n` block of `rhs` with the same matrix.
pub(crate) fn solve_blocks(
    linear: &DenseLinearSolver,
    matrix: &IterationMatrix,
    rhs: &mut [f64],
    stats: &mut EngineStats,
) -> Result<(), EngineFlag> {
    for block in rhs.chunks_mut(matrix.dim()) {
        linear.solve(matrix, block).map_err(linear_failure)?;
        stats.n_linear_solves += 1;
    }
    Ok(())
}

/// Shared borrows every system needs.
pub(crate) struct SystemContext<'a, P: OdeProblem + ?Sized> {
    pub problem: &'a P,
    pub user_data: &'a [f64],
    pub linear: &'a DenseLinearSolver,
    pub matrix: &'a IterationMatrix,
}

impl<P: OdeProblem + ?Sized> Clone for SystemContext<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: OdeProblem + ?Sized> Copy for SystemContext<'_, P> {}

/// `dy/dt = f(t, y)`.
pub(crate) struct StateSystem<'a, P: OdeProblem + ?Sized> {
    pub ctx: SystemContext<'a, P>,
    pub stats: &'a mut EngineStats,
}

impl<P: OdeProblem + ?Sized> StageSystem for StateSystem<'_, P> {
    fn dim(&self) -> usize {
        self.ctx.matrix.dim()
    }

    fn eval(&mut self, t: f64, z: &[f64], out: &mut [f64]) -> Result<(), EngineFlag> {
        self.stats.n_rhs_evals += 1;
        self.ctx
            .problem
            .rhs(t, z, out, self.ctx.user_data)
            .map_err(|e| rhs_failure(t, e))
    }

    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), EngineFlag> {
        solve_blocks(self.ctx.linear, self.ctx.matrix, rhs, self.stats)
    }
}

/// State and sensitivities stacked as `[y; s_0; ...; s_{np-1}]`.
pub(crate) struct CoupledSystem<'a, P: OdeProblem + ?Sized> {
    pub ctx: SystemContext<'a, P>,
    pub n_params: usize,
    pub stats: &'a mut EngineStats,
}

impl<P: OdeProblem + ?Sized> StageSystem for CoupledSystem<'_, P> {
    fn dim(&self) -> usize {
        self.ctx.matrix.dim() * (1 + self.n_params)
    }

    fn eval(&mut self, t: f64, z: &[f64], out: &mut [f64]) -> Result<(), EngineFlag> {
        let n = self.ctx.matrix.dim();
        let (y, sens) = z.split_at(n);
        let (ydot, sens_dot) = out.split_at_mut(n);
        self.stats.n_rhs_evals += 1;
        self.ctx
            .problem
            .rhs(t, y, ydot, self.ctx.user_data)
            .map_err(|e| rhs_failure(t, e))?;
        self.ctx
            .problem
            .sensitivity_rhs(t, y, ydot, sens, sens_dot, self.ctx.user_data)
            .map_err(|e| rhs_failure(t, e))
    }

    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), EngineFlag> {
        solve_blocks(self.ctx.linear, self.ctx.matrix, rhs, self.stats)
    }
}

/// Sensitivities alone, with the state stages of the current step fixed.
pub(crate) struct StaggeredSensSystem<'a, P: OdeProblem + ?Sized> {
    pub ctx: SystemContext<'a, P>,
    pub n_params: usize,
    /// State stage values and derivatives of the accepted state step.
    pub state_z: &'a [Vec<f64>; 3],
    pub state_g: &'a [Vec<f64>; 3],
    pub stage: usize,
    pub stats: &'a mut EngineStats,
}

impl<P: OdeProblem + ?Sized> StageSystem for StaggeredSensSystem<'_, P> {
    fn dim(&self) -> usize {
        self.ctx.matrix.dim() * self.n_params
    }

    fn begin_stage(&mut self, stage: usize) {
        self.stage = stage;
    }

    fn eval(&mut self, t: f64, z: &[f64], out: &mut [f64]) -> Result<(), EngineFlag> {
        let y = &self.state_z[self.stage];
        let ydot = &self.state_g[self.stage];
        self.ctx
            .problem
            .sensitivity_rhs(t, y, ydot, z, out, self.ctx.user_data)
            .map_err(|e| rhs_failure(t, e))
    }

    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), EngineFlag> {
        solve_blocks(self.ctx.linear, self.ctx.matrix, rhs, self.stats)
    }
}

/// `dλ/dt = adjoint_rhs(t, y(t), λ)` with `y(t)` taken from a recomputed
/// forward window.
pub(crate) struct AdjointSystem<'a, P: OdeProblem + ?Sized> {
    pub ctx: SystemContext<'a, P>,
    pub window: &'a DenseWindow,
    pub interpolation: Interpolation,
    pub y: Vec<f64>,
    pub stats: &'a mut EngineStats,
}

impl<P: OdeProblem + ?Sized> AdjointSystem<'_, P> {
    /// Forward state at `t` into the internal buffer.
    pub fn forward_state(&mut self, t: f64) -> &[f64] {
        self.window.interpolate(t, self.interpolation, &mut self.y);
        &self.y
    }
}

impl<P: OdeProblem + ?Sized> StageSystem for AdjointSystem<'_, P> {
    fn dim(&self) -> usize {
        self.ctx.matrix.dim()
    }

    fn eval(&mut self, t: f64, z: &[f64], out: &mut [f64]) -> Result<(), EngineFlag> {
        self.window.interpolate(t, self.interpolation, &mut self.y);
        self.stats.n_rhs_evals += 1;
        self.ctx
            .problem
            .adjoint_rhs(t, &self.y, z, out, self.ctx.user_data)
            .map_err(|e| rhs_failure(t, e))
    }

    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), EngineFlag> {
        solve_blocks(self.ctx.linear, self.ctx.matrix, rhs, self.stats)
    }
}
