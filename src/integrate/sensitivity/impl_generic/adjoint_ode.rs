//! Checkpointed adjoint solver.
//!
//! Computes gradients of `L = Σ_i g_i · y(t_i)` with respect to the initial
//! state and the differentiable parameters in two passes:
//!
//! 1. **Forward pass**: integrate `dy/dt = f(t, y, p)` over the output times,
//!    storing checkpoints in the engine.
//! 2. **Backward pass**: integrate `dλ/dt = -Jᵀλ` from the final time down to
//!    `t0`, one sub-interval between consecutive output times at a time. At
//!    each output time `t_i` the adjoint jumps by `-g_i`. The quadrature
//!    `q' = λᵀ ∂f/∂p` is carried along, so that after reaching `t0`
//!    `q = dL/dp` and `-λ = dL/dy0`.
//!
//! The solver tracks its phase so that a backward pass is only attempted on
//! top of a completed forward pass with the current parameters.

use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::impl_generic::ode::{
    step_until, validate_time_grid, SdirkEngine, Trajectory,
};
use crate::integrate::ode::SolverOptions;
use crate::integrate::sensitivity::traits::{AdjointOptions, AdjointPhase, BackwardSolution};
use crate::integrate::traits::{AdjointEngine, EngineStats, OdeProblem, StepStatus};
use crate::params::{ParamAccess, ParamSpace};

/// Adjoint gradient solver.
///
/// ```text
/// Idle --solve_forward--> ForwardPass --solve_backward--> BackwardPass --> Done
///   ^                          |                               |
///   +---- parameter update     +--------- failure -------------+--> Failed
/// ```
///
/// A new forward pass may be started from any phase.
pub struct AdjointSolver<P: OdeProblem, E: AdjointEngine = SdirkEngine> {
    problem: P,
    user_data: Vec<f64>,
    engine: E,
    max_retries: usize,
    phase: AdjointPhase,
    /// Time span of the last completed forward pass.
    forward_span: Option<(f64, f64)>,
}

impl<P: OdeProblem> AdjointSolver<P> {
    pub fn new(
        problem: P,
        options: SolverOptions,
        adj_options: AdjointOptions,
    ) -> IntegrateResult<Self> {
        let engine = SdirkEngine::new(problem.n_states(), options)?;
        Self::with_engine(problem, engine, &adj_options)
    }
}

impl<P: OdeProblem, E: AdjointEngine> AdjointSolver<P, E> {
    /// Create a solver around an existing engine, enabling adjoints on it.
    pub fn with_engine(
        problem: P,
        mut engine: E,
        adj_options: &AdjointOptions,
    ) -> IntegrateResult<Self> {
        let n = problem.n_states();
        if engine.n_states() != n {
            return Err(IntegrateError::shape("engine states", n, engine.n_states()));
        }
        adj_options.validate(n)?;
        engine.adj_init(problem.n_params(), adj_options)?;
        let user_data = problem.make_user_data();
        Ok(Self {
            problem,
            user_data,
            engine,
            max_retries: adj_options.max_retries,
            phase: AdjointPhase::Idle,
            forward_span: None,
        })
    }

    pub fn phase(&self) -> AdjointPhase {
        self.phase
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn n_states(&self) -> usize {
        self.problem.n_states()
    }

    pub fn n_params(&self) -> usize {
        self.problem.n_params()
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn make_output_buffers(&self, n_times: usize) -> Trajectory {
        Trajectory::zeros(n_times, self.n_states())
    }

    /// Checkpointed forward pass from `(t0, y0)`, returning the states at
    /// `tvals`.
    pub fn solve_forward(
        &mut self,
        t0: f64,
        tvals: &[f64],
        y0: &[f64],
    ) -> IntegrateResult<Trajectory> {
        let n = self.n_states();
        validate_time_grid(t0, tvals)?;
        if y0.len() != n {
            return Err(IntegrateError::shape("initial state", n, y0.len()));
        }
        self.phase = AdjointPhase::ForwardPass;
        self.forward_span = None;
        match self.forward(t0, tvals, y0) {
            Ok(out) => {
                self.forward_span = Some((t0, self.engine.time()));
                Ok(out)
            }
            Err(err) => {
                log::warn!("adjoint forward pass failed: {}", err);
                self.phase = AdjointPhase::Failed;
                Err(err)
            }
        }
    }

    fn forward(&mut self, t0: f64, tvals: &[f64], y0: &[f64]) -> IntegrateResult<Trajectory> {
        let mut out = self.make_output_buffers(tvals.len());
        self.engine.reinit(t0, y0)?;
        self.engine.adj_reinit()?;
        let Self {
            problem,
            user_data,
            engine,
            ..
        } = self;
        for (i, &t) in tvals.iter().enumerate() {
            if t == t0 {
                out.row_mut(i).copy_from_slice(y0);
                continue;
            }
            let t_start = engine.time();
            step_until(t_start, t, || {
                engine.step_checkpointed(&*problem, &user_data[..], t)
            })?;
            out.row_mut(i).copy_from_slice(engine.state());
        }
        Ok(out)
    }

    /// Backward pass for `L = Σ_i grads[i] · y(tvals[i])`.
    ///
    /// `tvals` must be the output times of the preceding forward pass (or a
    /// subset of its span); `tend` is where the adjoint starts from zero and
    /// must not precede the last output time.
    pub fn solve_backward(
        &mut self,
        t0: f64,
        tend: f64,
        tvals: &[f64],
        grads: &Trajectory,
    ) -> IntegrateResult<BackwardSolution> {
        self.backward(t0, tend, tvals, grads, false)
    }

    /// Like [`solve_backward`](Self::solve_backward), additionally recording
    /// the adjoint and quadrature right after the jump at each output time.
    pub fn solve_backward_recorded(
        &mut self,
        t0: f64,
        tend: f64,
        tvals: &[f64],
        grads: &Trajectory,
    ) -> IntegrateResult<BackwardSolution> {
        self.backward(t0, tend, tvals, grads, true)
    }

    fn check_backward_inputs(
        &self,
        t0: f64,
        tend: f64,
        tvals: &[f64],
        grads: &Trajectory,
    ) -> IntegrateResult<()> {
        if self.phase != AdjointPhase::ForwardPass {
            return Err(IntegrateError::InvalidPhase {
                operation: "solve_backward",
                phase: self.phase,
            });
        }
        validate_time_grid(t0, tvals)?;
        if grads.n_times() != tvals.len() || grads.n_states() != self.n_states() {
            return Err(IntegrateError::shape(
                "gradient rows",
                tvals.len() * self.n_states(),
                grads.n_times() * grads.n_states(),
            ));
        }
        let last = tvals.last().copied().unwrap_or(t0);
        if !tend.is_finite() || tend < last {
            return Err(IntegrateError::InvalidInput {
                context: format!("end time {} precedes the last output time {}", tend, last),
            });
        }
        match self.forward_span {
            Some((start, end)) if t0 >= start && tend <= end => Ok(()),
            Some((start, end)) => Err(IntegrateError::InvalidInput {
                context: format!(
                    "backward interval [{}, {}] is outside the forward pass [{}, {}]",
                    t0, tend, start, end
                ),
            }),
            None => Err(IntegrateError::InvalidPhase {
                operation: "solve_backward",
                phase: self.phase,
            }),
        }
    }

    fn backward(
        &mut self,
        t0: f64,
        tend: f64,
        tvals: &[f64],
        grads: &Trajectory,
        record: bool,
    ) -> IntegrateResult<BackwardSolution> {
        self.check_backward_inputs(t0, tend, tvals, grads)?;
        self.phase = AdjointPhase::BackwardPass;
        match self.integrate_backward(t0, tend, tvals, grads, record) {
            Ok(solution) => {
                self.phase = AdjointPhase::Done;
                Ok(solution)
            }
            Err(err) => {
                log::warn!("adjoint backward pass failed: {}", err);
                self.phase = AdjointPhase::Failed;
                Err(err)
            }
        }
    }

    fn integrate_backward(
        &mut self,
        t0: f64,
        tend: f64,
        tvals: &[f64],
        grads: &Trajectory,
        record: bool,
    ) -> IntegrateResult<BackwardSolution> {
        let n = self.n_states();
        let np = self.n_params();
        let n_out = tvals.len();
        let max_retries = self.max_retries;

        let mut boundaries = Vec::with_capacity(n_out + 2);
        boundaries.push(tend);
        boundaries.extend(tvals.iter().rev());
        boundaries.push(t0);

        let mut lambda = vec![0.0; n];
        let mut quad = vec![0.0; np];
        let mut lambda_all = record.then(|| Trajectory::zeros(n_out, n));
        let mut quad_all = record.then(|| Trajectory::zeros(n_out, np));

        let Self {
            problem,
            user_data,
            engine,
            ..
        } = self;
        for (k, pair) in boundaries.windows(2).enumerate() {
            let (upper, lower) = (pair[0], pair[1]);
            if lower < upper {
                engine.backward_reinit(upper, &lambda)?;
                engine.quad_reinit(&quad)?;
                step_backward_with_retries(
                    &mut *engine,
                    &*problem,
                    &user_data[..],
                    upper,
                    lower,
                    max_retries,
                )?;
                lambda.copy_from_slice(engine.backward_state());
                quad.copy_from_slice(engine.backward_quad());
            }
            if k < n_out {
                let idx = n_out - 1 - k;
                for (l, g) in lambda.iter_mut().zip(grads.row(idx)) {
                    *l -= g;
                }
                if let Some(all) = lambda_all.as_mut() {
                    all.row_mut(idx).copy_from_slice(&lambda);
                }
                if let Some(all) = quad_all.as_mut() {
                    all.row_mut(idx).copy_from_slice(&quad);
                }
            }
        }

        Ok(BackwardSolution {
            grad_params: quad,
            lambda,
            lambda_all,
            quad_all,
        })
    }
}

/// Step the adjoint from `upper` down to `lower` with at most `max_retries`
/// step requests.
fn step_backward_with_retries<P, E>(
    engine: &mut E,
    problem: &P,
    user_data: &[f64],
    upper: f64,
    lower: f64,
    max_retries: usize,
) -> IntegrateResult<()>
where
    P: OdeProblem + ?Sized,
    E: AdjointEngine,
{
    for attempt in 1..=max_retries {
        match engine.step_backward(problem, user_data, lower) {
            StepStatus::Success => return Ok(()),
            StepStatus::TooMuchWork => {
                log::debug!(
                    "Too much work in backward interval [{}, {}], retry {}/{}",
                    lower,
                    upper,
                    attempt,
                    max_retries
                );
            }
            StepStatus::Failed(flag) => {
                return Err(IntegrateError::EngineFailure {
                    flag,
                    t_start: upper,
                    t_end: lower,
                })
            }
        }
    }
    Err(IntegrateError::TooManyRetries {
        t_upper: upper,
        t_lower: lower,
        retries: max_retries,
    })
}

impl<P: OdeProblem, E: AdjointEngine> ParamAccess for AdjointSolver<P, E> {
    fn param_parts(&mut self) -> (&ParamSpace, &mut [f64]) {
        (self.problem.params(), &mut self.user_data)
    }

    fn param_view(&self) -> (&ParamSpace, &[f64]) {
        (self.problem.params(), &self.user_data)
    }

    /// Stored checkpoints no longer describe the trajectory.
    fn params_changed(&mut self) {
        self.phase = AdjointPhase::Idle;
        self.forward_span = None;
    }
}
