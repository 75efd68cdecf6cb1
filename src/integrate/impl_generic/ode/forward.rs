//! Forward solver: sample the solution of an [`OdeProblem`] at requested
//! times.

use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

use super::engine::SdirkEngine;
use super::trajectory::{tensor_values, Trajectory};
use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::ode::SolverOptions;
use crate::integrate::traits::{EngineStats, IntegrationEngine, OdeProblem, StepStatus};
use crate::params::{ParamAccess, ParamSpace};

/// Check that `tvals` is finite, strictly increasing and starts at or after
/// `t0`.
pub(crate) fn validate_time_grid(t0: f64, tvals: &[f64]) -> IntegrateResult<()> {
    if !t0.is_finite() || tvals.iter().any(|t| !t.is_finite()) {
        return Err(IntegrateError::InvalidInput {
            context: "initial and output times must be finite".to_string(),
        });
    }
    if let Some(&first) = tvals.first() {
        if first < t0 {
            return Err(IntegrateError::InvalidInput {
                context: format!("first output time {} is before t0 = {}", first, t0),
            });
        }
    }
    if tvals.windows(2).any(|w| w[1] <= w[0]) {
        return Err(IntegrateError::InvalidInput {
            context: "output times must be strictly increasing".to_string(),
        });
    }
    Ok(())
}

/// Reissue a step request until it succeeds; only `TooMuchWork` is retried.
pub(crate) fn step_until<F>(t_start: f64, tout: f64, mut request: F) -> IntegrateResult<()>
where
    F: FnMut() -> StepStatus,
{
    let mut retries = 0usize;
    loop {
        match request() {
            StepStatus::Success => return Ok(()),
            StepStatus::TooMuchWork => {
                retries += 1;
                log::debug!(
                    "Too much work between {} and {}, reissuing step request ({})",
                    t_start,
                    tout,
                    retries
                );
            }
            StepStatus::Failed(flag) => {
                return Err(IntegrateError::EngineFailure {
                    flag,
                    t_start,
                    t_end: tout,
                })
            }
        }
    }
}

/// Integrates an [`OdeProblem`] and reports the state at each output time.
///
/// The solver owns the problem, its parameter buffer and the engine. Each
/// solve reinitializes the engine, so solves are independent of each other.
///
/// # Example
///
/// ```ignore
/// let mut solver = ForwardSolver::new(problem, SolverOptions::default())?;
/// solver.set_derivative_params(&[0.3])?;
/// let traj = solver.solve(0.0, &[0.0, 1.0, 2.0], &[1.0])?;
/// ```
pub struct ForwardSolver<P: OdeProblem, E: IntegrationEngine = SdirkEngine> {
    problem: P,
    user_data: Vec<f64>,
    engine: E,
}

impl<P: OdeProblem> ForwardSolver<P> {
    /// Create a solver with the bundled TR-BDF2 engine.
    pub fn new(problem: P, options: SolverOptions) -> IntegrateResult<Self> {
        let engine = SdirkEngine::new(problem.n_states(), options)?;
        Self::with_engine(problem, engine)
    }
}

impl<P: OdeProblem, E: IntegrationEngine> ForwardSolver<P, E> {
    /// Create a solver around an existing engine.
    pub fn with_engine(problem: P, engine: E) -> IntegrateResult<Self> {
        if engine.n_states() != problem.n_states() {
            return Err(IntegrateError::shape(
                "engine states",
                problem.n_states(),
                engine.n_states(),
            ));
        }
        let user_data = problem.make_user_data();
        Ok(Self {
            problem,
            user_data,
            engine,
        })
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn n_states(&self) -> usize {
        self.problem.n_states()
    }

    /// Current parameter buffer.
    pub fn user_data(&self) -> &[f64] {
        &self.user_data
    }

    /// Output buffer for `n_times` output times.
    pub fn make_output_buffers(&self, n_times: usize) -> Trajectory {
        Trajectory::zeros(n_times, self.n_states())
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Solve from `(t0, y0)` and return the states at `tvals`.
    pub fn solve(&mut self, t0: f64, tvals: &[f64], y0: &[f64]) -> IntegrateResult<Trajectory> {
        let mut out = self.make_output_buffers(tvals.len());
        self.solve_into(t0, tvals, y0, &mut out)?;
        Ok(out)
    }

    /// [`solve`](Self::solve) on numr tensors: `tvals` and `y0` are
    /// one-dimensional, the result is `[tvals.len(), n_states]` on the device
    /// of `y0`.
    pub fn solve_tensor(
        &mut self,
        t0: f64,
        tvals: &Tensor<CpuRuntime>,
        y0: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<Tensor<CpuRuntime>> {
        let times = tensor_values("output times", tvals, 1)?;
        let state = tensor_values("initial state", y0, 1)?;
        Ok(self.solve(t0, &times, &state)?.to_tensor(y0.device()))
    }

    /// Solve into a caller-provided buffer of shape `[tvals.len(), n_states]`.
    pub fn solve_into(
        &mut self,
        t0: f64,
        tvals: &[f64],
        y0: &[f64],
        out: &mut Trajectory,
    ) -> IntegrateResult<()> {
        let n = self.n_states();
        validate_time_grid(t0, tvals)?;
        if y0.len() != n {
            return Err(IntegrateError::shape("initial state", n, y0.len()));
        }
        if out.n_times() != tvals.len() || out.n_states() != n {
            return Err(IntegrateError::shape(
                "output rows",
                tvals.len() * n,
                out.n_times() * out.n_states(),
            ));
        }

        self.engine.reinit(t0, y0)?;
        let Self {
            problem,
            user_data,
            engine,
        } = self;
        for (i, &t) in tvals.iter().enumerate() {
            if t == t0 {
                out.row_mut(i).copy_from_slice(y0);
                continue;
            }
            let t_start = engine.time();
            step_until(t_start, t, || engine.step(&*problem, &user_data[..], t))?;
            out.row_mut(i).copy_from_slice(engine.state());
        }
        Ok(())
    }
}

impl<P: OdeProblem, E: IntegrationEngine> ParamAccess for ForwardSolver<P, E> {
    fn param_parts(&mut self) -> (&ParamSpace, &mut [f64]) {
        (self.problem.params(), &mut self.user_data)
    }

    fn param_view(&self) -> (&ParamSpace, &[f64]) {
        (self.problem.params(), &self.user_data)
    }
}
