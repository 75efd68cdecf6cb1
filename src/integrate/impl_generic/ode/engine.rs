//! TR-BDF2 integration engine with forward sensitivities and checkpointed
//! adjoints.
//!
//! # Forward stepping
//!
//! Each step request advances towards `tout` with at most
//! `SolverOptions::max_steps` accepted steps, clamping the last step so that
//! `tout` is hit exactly. The Jacobian is evaluated once per step at the step
//! start; rejected steps only rebuild the iteration matrix.
//!
//! # Adjoint stepping
//!
//! The backward problem never crosses a checkpoint. Before each backward
//! step the forward solution of the enclosing checkpoint interval is
//! recomputed (once per interval visit) and interpolated at the stage times.

use super::linear::{DenseLinearSolver, IterationMatrix};
use super::step_control::{
    error_weights, initial_step, min_step, step_factor, wrms_norm, MAX_FACTOR, MIN_FACTOR,
};
use super::systems::{
    rhs_failure, solve_blocks, AdjointSystem, CoupledSystem, StaggeredSensSystem, StateSystem,
    SystemContext,
};
use super::tr_bdf2::{self, attempt_step, NewtonControl, D};
use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::ode::{SolverOptions, Tolerance};
use crate::integrate::sensitivity::impl_generic::checkpointing::{
    CheckpointManager, DensePoint, DenseWindow,
};
use crate::integrate::sensitivity::{AdjointOptions, SensitivityMethod, SensitivityOptions};
use crate::integrate::traits::{
    AdjointEngine, EngineFlag, EngineStats, IntegrationEngine, OdeProblem, SensitivityEngine,
    StepStatus,
};

const MAX_CONV_FAILURES: usize = 10;
const MAX_ERROR_FAILURES: usize = 10;
const MAX_CONSTRAINT_FAILURES: usize = 10;

#[derive(Debug, Clone)]
struct ForwardState {
    t: f64,
    y: Vec<f64>,
    /// `f(t, y)` from the last accepted step.
    f: Option<Vec<f64>>,
    /// Proposed next step size.
    h: Option<f64>,
}

#[derive(Debug, Clone)]
struct SensState {
    method: SensitivityMethod,
    n_params: usize,
    s: Vec<f64>,
    atol_scale: Vec<f64>,
    error_control: bool,
}

#[derive(Debug, Clone)]
struct AdjointState {
    n_params: usize,
    options: AdjointOptions,
    checkpoints: CheckpointManager,
    tb: f64,
    lambda: Vec<f64>,
    quad: Vec<f64>,
    hb: Option<f64>,
    ready: bool,
}

struct StepSettings<'a> {
    options: &'a SolverOptions,
    constraints: Option<&'a [f64]>,
    linear: &'a DenseLinearSolver,
}

impl StepSettings<'_> {
    fn newton(&self) -> NewtonControl {
        NewtonControl {
            tol: self.options.newton_tol,
            max_iter: self.options.max_newton_iter,
        }
    }
}

struct SensStart<'a> {
    method: SensitivityMethod,
    n_params: usize,
    s: &'a [f64],
    sdot: &'a [f64],
    weights: &'a [f64],
    error_control: bool,
}

struct StepStart<'a> {
    t: f64,
    y: &'a [f64],
    f: &'a [f64],
    weights: &'a [f64],
    jac: &'a [f64],
    sens: Option<SensStart<'a>>,
}

struct Trial {
    y: Vec<f64>,
    f: Vec<f64>,
    s: Option<Vec<f64>>,
    err: f64,
}

/// L-stable TR-BDF2 engine solving its Newton systems with numr.
pub struct SdirkEngine {
    n: usize,
    options: SolverOptions,
    constraints: Option<Vec<f64>>,
    linear: DenseLinearSolver,
    fwd: Option<ForwardState>,
    sens: Option<SensState>,
    adjoint: Option<AdjointState>,
    stats: EngineStats,
}

impl SdirkEngine {
    /// Create an engine for `n_states` states.
    pub fn new(n_states: usize, options: SolverOptions) -> IntegrateResult<Self> {
        if n_states == 0 {
            return Err(IntegrateError::InvalidInput {
                context: "engine needs at least one state".to_string(),
            });
        }
        options.validate(n_states)?;
        let constraints = options.resolved_constraints(n_states)?;
        Ok(Self {
            n: n_states,
            options,
            constraints,
            linear: DenseLinearSolver::new(),
            fwd: None,
            sens: None,
            adjoint: None,
            stats: EngineStats::default(),
        })
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Number of stored checkpoints of the current forward pass.
    pub fn n_checkpoints(&self) -> usize {
        self.adjoint.as_ref().map_or(0, |a| a.checkpoints.len())
    }

    fn advance<P: OdeProblem + ?Sized>(
        &mut self,
        problem: &P,
        user_data: &[f64],
        tout: f64,
        record: bool,
    ) -> StepStatus {
        let Some(fwd) = self.fwd.as_mut() else {
            return StepStatus::Failed(EngineFlag::IllInput);
        };
        if !tout.is_finite() {
            return StepStatus::Failed(EngineFlag::IllInput);
        }
        if tout < fwd.t {
            return StepStatus::Failed(EngineFlag::BadTime);
        }
        let settings = StepSettings {
            options: &self.options,
            constraints: self.constraints.as_deref(),
            linear: &self.linear,
        };
        let mut steps = 0;
        while fwd.t < tout {
            if steps >= self.options.max_steps {
                return StepStatus::TooMuchWork;
            }
            if let Err(flag) = take_forward_step(
                &settings,
                problem,
                user_data,
                fwd,
                self.sens.as_mut(),
                &mut self.stats,
                tout,
            ) {
                return StepStatus::Failed(flag);
            }
            steps += 1;
            if record {
                if let Some(adj) = self.adjoint.as_mut() {
                    adj.checkpoints.record_step(fwd.t, &fwd.y, fwd.h);
                }
            }
        }
        StepStatus::Success
    }
}

impl Drop for SdirkEngine {
    fn drop(&mut self) {
        if let Some(adj) = &self.adjoint {
            log::debug!(
                "Freeing adjoint engine with {} checkpoints after {} forward and {} backward steps",
                adj.checkpoints.len(),
                self.stats.n_steps,
                self.stats.n_backward_steps
            );
        }
    }
}

impl IntegrationEngine for SdirkEngine {
    fn n_states(&self) -> usize {
        self.n
    }

    fn reinit(&mut self, t0: f64, y0: &[f64]) -> IntegrateResult<()> {
        if y0.len() != self.n {
            return Err(IntegrateError::shape("initial state", self.n, y0.len()));
        }
        if !t0.is_finite() || y0.iter().any(|v| !v.is_finite()) {
            return Err(IntegrateError::InvalidInput {
                context: "initial time and state must be finite".to_string(),
            });
        }
        self.fwd = Some(ForwardState {
            t: t0,
            y: y0.to_vec(),
            f: None,
            h: None,
        });
        if let Some(adj) = self.adjoint.as_mut() {
            adj.checkpoints.reset(t0, y0);
            adj.ready = false;
        }
        Ok(())
    }

    fn step<P: OdeProblem + ?Sized>(
        &mut self,
        problem: &P,
        user_data: &[f64],
        tout: f64,
    ) -> StepStatus {
        self.advance(problem, user_data, tout, false)
    }

    fn time(&self) -> f64 {
        self.fwd.as_ref().map_or(f64::NAN, |f| f.t)
    }

    fn state(&self) -> &[f64] {
        self.fwd.as_ref().map_or(&[], |f| &f.y)
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }
}

impl SensitivityEngine for SdirkEngine {
    fn sens_init(&mut self, n_params: usize, options: &SensitivityOptions) -> IntegrateResult<()> {
        let atol_scale = options.resolved_scaling(n_params)?;
        self.sens = Some(SensState {
            method: options.method,
            n_params,
            s: vec![0.0; n_params * self.n],
            atol_scale,
            error_control: !options.skip_error_control,
        });
        Ok(())
    }

    fn sens_reinit(&mut self, sens0: &[f64]) -> IntegrateResult<()> {
        let n = self.n;
        let sens = self.sens.as_mut().ok_or_else(|| IntegrateError::InvalidInput {
            context: "sensitivities are not enabled".to_string(),
        })?;
        if sens0.len() != sens.n_params * n {
            return Err(IntegrateError::shape(
                "initial sensitivities",
                sens.n_params * n,
                sens0.len(),
            ));
        }
        sens.s.copy_from_slice(sens0);
        if let Some(fwd) = self.fwd.as_mut() {
            fwd.f = None;
            fwd.h = None;
        }
        Ok(())
    }

    fn sensitivities(&self) -> &[f64] {
        self.sens.as_ref().map_or(&[], |s| &s.s)
    }
}

impl AdjointEngine for SdirkEngine {
    fn adj_init(&mut self, n_params: usize, options: &AdjointOptions) -> IntegrateResult<()> {
        options.validate(self.n)?;
        self.adjoint = Some(AdjointState {
            n_params,
            checkpoints: CheckpointManager::new(options.n_checkpoints),
            options: options.clone(),
            tb: f64::NAN,
            lambda: vec![0.0; self.n],
            quad: vec![0.0; n_params],
            hb: None,
            ready: false,
        });
        Ok(())
    }

    fn adj_reinit(&mut self) -> IntegrateResult<()> {
        let (Some(adj), Some(fwd)) = (self.adjoint.as_mut(), self.fwd.as_ref()) else {
            return Err(IntegrateError::InvalidInput {
                context: "adjoint reinit needs an initialized adjoint engine and state".to_string(),
            });
        };
        adj.checkpoints.reset(fwd.t, &fwd.y);
        adj.ready = false;
        Ok(())
    }

    fn step_checkpointed<P: OdeProblem + ?Sized>(
        &mut self,
        problem: &P,
        user_data: &[f64],
        tout: f64,
    ) -> StepStatus {
        if self.adjoint.is_none() {
            return StepStatus::Failed(EngineFlag::IllInput);
        }
        self.advance(problem, user_data, tout, true)
    }

    fn backward_reinit(&mut self, t_upper: f64, lambda: &[f64]) -> IntegrateResult<()> {
        let n = self.n;
        let adj = self.adjoint.as_mut().ok_or_else(|| IntegrateError::InvalidInput {
            context: "adjoint is not enabled".to_string(),
        })?;
        if lambda.len() != n {
            return Err(IntegrateError::shape("adjoint", n, lambda.len()));
        }
        let Some((t0, t_end)) = adj.checkpoints.span() else {
            return Err(IntegrateError::InvalidInput {
                context: "backward integration needs a forward pass".to_string(),
            });
        };
        if !(t_upper >= t0 && t_upper <= t_end) {
            return Err(IntegrateError::InvalidInput {
                context: format!(
                    "backward start time {} outside the forward span [{}, {}]",
                    t_upper, t0, t_end
                ),
            });
        }
        adj.tb = t_upper;
        adj.lambda.copy_from_slice(lambda);
        adj.hb = None;
        adj.ready = true;
        Ok(())
    }

    fn quad_reinit(&mut self, quad: &[f64]) -> IntegrateResult<()> {
        let adj = self.adjoint.as_mut().ok_or_else(|| IntegrateError::InvalidInput {
            context: "adjoint is not enabled".to_string(),
        })?;
        if quad.len() != adj.n_params {
            return Err(IntegrateError::shape("quadrature", adj.n_params, quad.len()));
        }
        adj.quad.copy_from_slice(quad);
        Ok(())
    }

    fn step_backward<P: OdeProblem + ?Sized>(
        &mut self,
        problem: &P,
        user_data: &[f64],
        t_lower: f64,
    ) -> StepStatus {
        let Some(adj) = self.adjoint.as_mut() else {
            return StepStatus::Failed(EngineFlag::NoForwardData);
        };
        if !adj.ready {
            return StepStatus::Failed(EngineFlag::IllInput);
        }
        match adj.checkpoints.span() {
            Some((t0, _)) if t_lower >= t0 && t_lower <= adj.tb => {}
            Some(_) => return StepStatus::Failed(EngineFlag::BadTime),
            None => return StepStatus::Failed(EngineFlag::NoForwardData),
        }
        let settings = StepSettings {
            options: &self.options,
            constraints: None,
            linear: &self.linear,
        };
        let mut steps = 0;
        while adj.tb > t_lower {
            if steps >= adj.options.backward_max_steps {
                return StepStatus::TooMuchWork;
            }
            if let Err(flag) =
                take_backward_step(&settings, problem, user_data, adj, &mut self.stats, t_lower)
            {
                return StepStatus::Failed(flag);
            }
            steps += 1;
        }
        StepStatus::Success
    }

    fn backward_time(&self) -> f64 {
        self.adjoint.as_ref().map_or(f64::NAN, |a| a.tb)
    }

    fn backward_state(&self) -> &[f64] {
        self.adjoint.as_ref().map_or(&[], |a| &a.lambda)
    }

    fn backward_quad(&self) -> &[f64] {
        self.adjoint.as_ref().map_or(&[], |a| &a.quad)
    }
}

fn filtered_norm(
    linear: &DenseLinearSolver,
    matrix: &IterationMatrix,
    err: &mut [f64],
    weights: &[f64],
    stats: &mut EngineStats,
) -> Result<f64, EngineFlag> {
    solve_blocks(linear, matrix, err, stats)?;
    Ok(wrms_norm(err, weights))
}

fn violates_constraints(constraints: &[f64], y: &[f64]) -> bool {
    constraints.iter().zip(y).any(|(c, v)| match *c as i32 {
        1 => *v < 0.0,
        -1 => *v > 0.0,
        2 => *v <= 0.0,
        -2 => *v >= 0.0,
        _ => false,
    })
}

/// One attempted forward step of size `h`; `None` when Newton failed.
fn forward_trial<P: OdeProblem + ?Sized>(
    settings: &StepSettings<'_>,
    problem: &P,
    user_data: &[f64],
    start: &StepStart<'_>,
    h: f64,
    stats: &mut EngineStats,
) -> Result<Option<Trial>, EngineFlag> {
    let n = start.y.len();
    let linear = settings.linear;
    let matrix = linear.iteration_matrix(start.jac, n, h * D);
    let newton = settings.newton();
    let ctx = SystemContext {
        problem,
        user_data,
        linear,
        matrix: &matrix,
    };

    let Some(sens) = &start.sens else {
        let sol = {
            let mut system = StateSystem { ctx, stats: &mut *stats };
            attempt_step(&mut system, start.t, h, start.y, start.f, start.weights, newton)?
        };
        let Some(mut sol) = sol else {
            return Ok(None);
        };
        let err = filtered_norm(linear, &matrix, &mut sol.err, start.weights, stats)?;
        let [_, _, y] = sol.z;
        let [_, _, f] = sol.g;
        return Ok(Some(Trial { y, f, s: None, err }));
    };

    match sens.method {
        SensitivityMethod::Simultaneous => {
            let z0: Vec<f64> = start.y.iter().chain(sens.s).copied().collect();
            let g0: Vec<f64> = start.f.iter().chain(sens.sdot).copied().collect();
            let w: Vec<f64> = start.weights.iter().chain(sens.weights).copied().collect();
            let sol = {
                let mut system = CoupledSystem {
                    ctx,
                    n_params: sens.n_params,
                    stats: &mut *stats,
                };
                attempt_step(&mut system, start.t, h, &z0, &g0, &w, newton)?
            };
            let Some(mut sol) = sol else {
                return Ok(None);
            };
            let (state_err, sens_err) = sol.err.split_at_mut(n);
            let e_state = filtered_norm(linear, &matrix, state_err, start.weights, stats)?;
            let e_sens = filtered_norm(linear, &matrix, sens_err, sens.weights, stats)?;
            let err = if sens.error_control {
                e_state.max(e_sens)
            } else {
                e_state
            };
            let [_, _, mut y] = sol.z;
            let s = y.split_off(n);
            let [_, _, mut f] = sol.g;
            f.truncate(n);
            Ok(Some(Trial {
                y,
                f,
                s: Some(s),
                err,
            }))
        }
        SensitivityMethod::Staggered => {
            let state_sol = {
                let mut system = StateSystem { ctx, stats: &mut *stats };
                attempt_step(&mut system, start.t, h, start.y, start.f, start.weights, newton)?
            };
            let Some(mut state_sol) = state_sol else {
                return Ok(None);
            };
            let sens_sol = {
                let mut system = StaggeredSensSystem {
                    ctx,
                    n_params: sens.n_params,
                    state_z: &state_sol.z,
                    state_g: &state_sol.g,
                    stage: 0,
                    stats: &mut *stats,
                };
                attempt_step(&mut system, start.t, h, sens.s, sens.sdot, sens.weights, newton)?
            };
            let Some(mut sens_sol) = sens_sol else {
                return Ok(None);
            };
            let e_state = filtered_norm(linear, &matrix, &mut state_sol.err, start.weights, stats)?;
            let e_sens = filtered_norm(linear, &matrix, &mut sens_sol.err, sens.weights, stats)?;
            let err = if sens.error_control {
                e_state.max(e_sens)
            } else {
                e_state
            };
            let [_, _, y] = state_sol.z;
            let [_, _, f] = state_sol.g;
            let [_, _, s] = sens_sol.z;
            Ok(Some(Trial {
                y,
                f,
                s: Some(s),
                err,
            }))
        }
    }
}

/// Take one accepted forward step towards `tout`.
fn take_forward_step<P: OdeProblem + ?Sized>(
    settings: &StepSettings<'_>,
    problem: &P,
    user_data: &[f64],
    fwd: &mut ForwardState,
    sens: Option<&mut SensState>,
    stats: &mut EngineStats,
    tout: f64,
) -> Result<(), EngineFlag> {
    let n = fwd.y.len();
    let t = fwd.t;
    let span = tout - t;
    let options = settings.options;

    let f0 = match fwd.f.take() {
        Some(f) => f,
        None => {
            let mut f = vec![0.0; n];
            stats.n_rhs_evals += 1;
            problem
                .rhs(t, &fwd.y, &mut f, user_data)
                .map_err(|e| rhs_failure(t, e))?;
            f
        }
    };
    let mut weights = vec![0.0; n];
    error_weights(&fwd.y, &options.rtol, &options.atol, 1.0, &mut weights);
    let mut jac = vec![0.0; n * n];
    stats.n_jac_evals += 1;
    problem
        .jac(t, &fwd.y, &mut jac, user_data)
        .map_err(|e| rhs_failure(t, e))?;

    let sens_data = match &sens {
        Some(s) => {
            let mut sdot = vec![0.0; s.s.len()];
            problem
                .sensitivity_rhs(t, &fwd.y, &f0, &s.s, &mut sdot, user_data)
                .map_err(|e| rhs_failure(t, e))?;
            let mut sw = vec![0.0; s.s.len()];
            for (j, scale) in s.atol_scale.iter().enumerate() {
                let block = j * n..(j + 1) * n;
                error_weights(
                    &s.s[block.clone()],
                    &options.rtol,
                    &options.atol,
                    *scale,
                    &mut sw[block],
                );
            }
            Some((sdot, sw))
        }
        None => None,
    };
    let sens_start = match (&sens, &sens_data) {
        (Some(s), Some((sdot, sw))) => Some(SensStart {
            method: s.method,
            n_params: s.n_params,
            s: &s.s,
            sdot,
            weights: sw,
            error_control: s.error_control,
        }),
        _ => None,
    };
    let start = StepStart {
        t,
        y: &fwd.y,
        f: &f0,
        weights: &weights,
        jac: &jac,
        sens: sens_start,
    };

    let hmin = min_step(t, tout);
    let mut h = fwd
        .h
        .or(options.h0)
        .unwrap_or_else(|| initial_step(&fwd.y, &f0, &weights, span));
    if let Some(hmax) = options.max_step {
        h = h.min(hmax);
    }
    let (mut n_conv, mut n_err, mut n_constr) = (0, 0, 0);

    loop {
        let reaches_end = h >= span || span - h <= hmin;
        let h_try = if reaches_end { span } else { h };
        let Some(trial) = forward_trial(settings, problem, user_data, &start, h_try, stats)? else {
            stats.n_newton_failures += 1;
            n_conv += 1;
            if n_conv >= MAX_CONV_FAILURES || h_try <= hmin {
                return Err(EngineFlag::ConvFailure);
            }
            h = h_try * 0.25;
            continue;
        };
        if !(trial.err <= 1.0) {
            stats.n_error_test_failures += 1;
            n_err += 1;
            if n_err >= MAX_ERROR_FAILURES || h_try <= hmin {
                return Err(EngineFlag::ErrFailure);
            }
            let factor = if trial.err.is_finite() {
                step_factor(trial.err)
            } else {
                MIN_FACTOR
            };
            h = h_try * factor;
            continue;
        }
        if let Some(c) = settings.constraints {
            if violates_constraints(c, &trial.y) {
                n_constr += 1;
                if n_constr >= MAX_CONSTRAINT_FAILURES || h_try <= hmin {
                    return Err(EngineFlag::ConstraintFailure);
                }
                h = h_try * 0.5;
                continue;
            }
        }

        let mut h_next = h_try * step_factor(trial.err);
        if reaches_end {
            h_next = h_next.max(h.min(h_try * MAX_FACTOR));
        }
        if let Some(hmax) = options.max_step {
            h_next = h_next.min(hmax);
        }
        fwd.t = if reaches_end { tout } else { t + h_try };
        fwd.y = trial.y;
        fwd.f = Some(trial.f);
        fwd.h = Some(h_next);
        if let (Some(sens), Some(s)) = (sens, trial.s) {
            sens.s = s;
        }
        stats.n_steps += 1;
        return Ok(());
    }
}

/// Recompute the forward solution on checkpoint interval `index`.
fn recompute_window<P: OdeProblem + ?Sized>(
    settings: &StepSettings<'_>,
    problem: &P,
    user_data: &[f64],
    checkpoints: &CheckpointManager,
    index: usize,
    stats: &mut EngineStats,
) -> Result<DenseWindow, EngineFlag> {
    let ck = checkpoints.get(index).ok_or(EngineFlag::NoForwardData)?;
    let t_end = checkpoints.interval_end(index);
    let mut f = vec![0.0; ck.y.len()];
    stats.n_rhs_evals += 1;
    problem
        .rhs(ck.t, &ck.y, &mut f, user_data)
        .map_err(|e| rhs_failure(ck.t, e))?;
    let mut points = vec![DensePoint {
        t: ck.t,
        y: ck.y.clone(),
        f: f.clone(),
    }];
    let mut state = ForwardState {
        t: ck.t,
        y: ck.y.clone(),
        f: Some(f),
        h: ck.h,
    };
    while state.t < t_end {
        take_forward_step(settings, problem, user_data, &mut state, None, stats, t_end)?;
        points.push(DensePoint {
            t: state.t,
            y: state.y.clone(),
            f: state.f.clone().unwrap_or_default(),
        });
    }
    stats.n_recomputed_windows += 1;
    Ok(DenseWindow::new(index, points))
}

/// Take one accepted backward step towards `t_lower`, never crossing the
/// checkpoint below the current time.
fn take_backward_step<P: OdeProblem + ?Sized>(
    settings: &StepSettings<'_>,
    problem: &P,
    user_data: &[f64],
    adj: &mut AdjointState,
    stats: &mut EngineStats,
    t_lower: f64,
) -> Result<(), EngineFlag> {
    let tb = adj.tb;
    let n = adj.lambda.len();
    let np = adj.n_params;
    let index = adj
        .checkpoints
        .find_interval(tb)
        .ok_or(EngineFlag::BadTime)?;
    if adj.checkpoints.window(index).is_none() {
        let window =
            recompute_window(settings, problem, user_data, &adj.checkpoints, index, stats)?;
        adj.checkpoints.load_window(window);
    }
    let window = adj
        .checkpoints
        .window(index)
        .ok_or(EngineFlag::NoForwardData)?;
    let t_floor = adj
        .checkpoints
        .get(index)
        .map_or(t_lower, |c| c.t.max(t_lower));
    let span = tb - t_floor;
    let interpolation = adj.options.interpolation;

    let mut y_tb = vec![0.0; n];
    window.interpolate(tb, interpolation, &mut y_tb);
    let mut g0 = vec![0.0; n];
    stats.n_rhs_evals += 1;
    problem
        .adjoint_rhs(tb, &y_tb, &adj.lambda, &mut g0, user_data)
        .map_err(|e| rhs_failure(tb, e))?;
    let mut q0 = vec![0.0; np];
    problem
        .adjoint_quad_rhs(tb, &y_tb, &adj.lambda, &mut q0, user_data)
        .map_err(|e| rhs_failure(tb, e))?;
    let mut jac_b = vec![0.0; n * n];
    stats.n_jac_evals += 1;
    problem
        .adjoint_jac(tb, &y_tb, &mut jac_b, user_data)
        .map_err(|e| rhs_failure(tb, e))?;

    let mut wb = vec![0.0; n];
    error_weights(
        &adj.lambda,
        &adj.options.backward_rtol,
        &adj.options.backward_atol,
        1.0,
        &mut wb,
    );
    let mut wq = vec![0.0; np];
    error_weights(
        &adj.quad,
        &Tolerance::Scalar(adj.options.quad_rtol),
        &Tolerance::Scalar(adj.options.quad_atol),
        1.0,
        &mut wq,
    );

    let linear = settings.linear;
    let newton = settings.newton();
    let hmin = min_step(tb, t_floor);
    let mut h = adj
        .hb
        .unwrap_or_else(|| initial_step(&adj.lambda, &g0, &wb, span));
    let offsets = tr_bdf2::stage_offsets();
    let b = tr_bdf2::weights();
    let e = tr_bdf2::error_weights();
    let (mut n_conv, mut n_err) = (0, 0);

    loop {
        let reaches_end = h >= span || span - h <= hmin;
        let h_try = if reaches_end { span } else { h };
        let hs = -h_try;
        let matrix = linear.iteration_matrix(&jac_b, n, hs * D);
        let mut qdots = [q0.clone(), vec![0.0; np], vec![0.0; np]];
        let sol = {
            let mut system = AdjointSystem {
                ctx: SystemContext {
                    problem,
                    user_data,
                    linear,
                    matrix: &matrix,
                },
                window,
                interpolation,
                y: vec![0.0; n],
                stats: &mut *stats,
            };
            let sol = attempt_step(&mut system, tb, hs, &adj.lambda, &g0, &wb, newton)?;
            if let Some(sol) = &sol {
                for stage in 1..3 {
                    let ts = tb + offsets[stage] * hs;
                    let y = system.forward_state(ts);
                    problem
                        .adjoint_quad_rhs(ts, y, &sol.z[stage], &mut qdots[stage], user_data)
                        .map_err(|e| rhs_failure(ts, e))?;
                }
            }
            sol
        };
        let Some(mut sol) = sol else {
            stats.n_newton_failures += 1;
            n_conv += 1;
            if n_conv >= MAX_CONV_FAILURES || h_try <= hmin {
                return Err(EngineFlag::ConvFailure);
            }
            h = h_try * 0.25;
            continue;
        };

        let mut q_new = adj.quad.clone();
        let mut q_err = vec![0.0; np];
        for j in 0..np {
            q_new[j] += hs * (b[0] * qdots[0][j] + b[1] * qdots[1][j] + b[2] * qdots[2][j]);
            q_err[j] = hs * (e[0] * qdots[0][j] + e[1] * qdots[1][j] + e[2] * qdots[2][j]);
        }
        let e_lambda = filtered_norm(linear, &matrix, &mut sol.err, &wb, stats)?;
        let err = if adj.options.quad_error_control {
            e_lambda.max(wrms_norm(&q_err, &wq))
        } else {
            e_lambda
        };

        if !(err <= 1.0) {
            stats.n_error_test_failures += 1;
            n_err += 1;
            if n_err >= MAX_ERROR_FAILURES || h_try <= hmin {
                return Err(EngineFlag::ErrFailure);
            }
            let factor = if err.is_finite() { step_factor(err) } else { MIN_FACTOR };
            h = h_try * factor;
            continue;
        }

        let mut h_next = h_try * step_factor(err);
        if reaches_end {
            h_next = h_next.max(h.min(h_try * MAX_FACTOR));
        }
        let [_, _, lambda] = sol.z;
        adj.tb = if reaches_end { t_floor } else { tb - h_try };
        adj.lambda = lambda;
        adj.quad = q_new;
        adj.hb = Some(h_next);
        stats.n_backward_steps += 1;
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::traits::AdTensor;
    use crate::params::{ParamSpace, ParamTree};
    use approx::assert_abs_diff_eq;
    use numr::runtime::cpu::CpuClient;

    /// dy/dt = -k y
    struct Decay {
        params: ParamSpace,
    }

    impl Decay {
        fn new(k: f64) -> Self {
            let defaults = ParamTree::group().with("k", k);
            Self {
                params: ParamSpace::new(&defaults, None).unwrap(),
            }
        }
    }

    impl OdeProblem for Decay {
        fn n_states(&self) -> usize {
            1
        }
        fn params(&self) -> &ParamSpace {
            &self.params
        }
        fn rhs_ad<T: AdTensor>(
            &self,
            _t: f64,
            y: &T,
            p: &T,
            client: &CpuClient,
        ) -> numr::error::Result<T> {
            p.at(0, client)?.neg(client)?.mul(y, client)
        }
        fn rhs(&self, _t: f64, y: &[f64], ydot: &mut [f64], p: &[f64]) -> IntegrateResult<()> {
            ydot[0] = -p[0] * y[0];
            Ok(())
        }
        fn jac(&self, _t: f64, _y: &[f64], jac: &mut [f64], p: &[f64]) -> IntegrateResult<()> {
            jac[0] = -p[0];
            Ok(())
        }
    }

    fn engine(options: SolverOptions) -> SdirkEngine {
        SdirkEngine::new(1, options).unwrap()
    }

    fn run_to<P: OdeProblem>(
        engine: &mut SdirkEngine,
        problem: &P,
        p: &[f64],
        tout: f64,
    ) -> StepStatus {
        let mut status = engine.step(problem, p, tout);
        while status == StepStatus::TooMuchWork {
            status = engine.step(problem, p, tout);
        }
        status
    }

    #[test]
    fn test_step_hits_target_exactly() {
        let problem = Decay::new(2.0);
        let p = problem.make_user_data();
        let mut engine = engine(SolverOptions::with_tolerances(1e-10, 1e-12));
        engine.reinit(0.0, &[1.0]).unwrap();
        assert_eq!(run_to(&mut engine, &problem, &p, 0.7), StepStatus::Success);
        assert_eq!(engine.time(), 0.7);
        let exact = (-2.0 * 0.7_f64).exp();
        assert_abs_diff_eq!(engine.state()[0], exact, epsilon = 1e-6);
        assert!(engine.stats().n_steps > 0);
    }

    #[test]
    fn test_step_to_current_time_is_noop() {
        let problem = Decay::new(1.0);
        let p = problem.make_user_data();
        let mut engine = engine(SolverOptions::default());
        engine.reinit(1.0, &[3.0]).unwrap();
        assert_eq!(engine.step(&problem, &p, 1.0), StepStatus::Success);
        assert_eq!(engine.state(), &[3.0]);
        assert_eq!(engine.stats().n_steps, 0);
    }

    #[test]
    fn test_backwards_target_is_rejected() {
        let problem = Decay::new(1.0);
        let p = problem.make_user_data();
        let mut engine = engine(SolverOptions::default());
        engine.reinit(1.0, &[3.0]).unwrap();
        assert_eq!(
            engine.step(&problem, &p, 0.5),
            StepStatus::Failed(EngineFlag::BadTime)
        );
    }

    #[test]
    fn test_step_before_reinit() {
        let problem = Decay::new(1.0);
        let p = problem.make_user_data();
        let mut engine = engine(SolverOptions::default());
        assert_eq!(
            engine.step(&problem, &p, 1.0),
            StepStatus::Failed(EngineFlag::IllInput)
        );
    }

    #[test]
    fn test_too_much_work_is_resumable() {
        let problem = Decay::new(1.0);
        let p = problem.make_user_data();
        let mut engine = engine(SolverOptions::with_tolerances(1e-10, 1e-10).max_steps(3));
        engine.reinit(0.0, &[1.0]).unwrap();
        let mut requests = 1;
        let mut status = engine.step(&problem, &p, 5.0);
        assert_eq!(status, StepStatus::TooMuchWork);
        while status == StepStatus::TooMuchWork {
            assert!(engine.time() < 5.0);
            status = engine.step(&problem, &p, 5.0);
            requests += 1;
        }
        assert_eq!(status, StepStatus::Success);
        assert!(requests > 2);
        assert_abs_diff_eq!(engine.state()[0], (-5.0_f64).exp(), epsilon = 1e-7);
    }

    #[test]
    fn test_stiff_linear_system() {
        // y0' = -1000 y0 + y1, y1' = -y1
        struct Stiff {
            params: ParamSpace,
        }
        impl OdeProblem for Stiff {
            fn n_states(&self) -> usize {
                2
            }
            fn params(&self) -> &ParamSpace {
                &self.params
            }
            fn rhs_ad<T: AdTensor>(
                &self,
                _t: f64,
                y: &T,
                _p: &T,
                client: &CpuClient,
            ) -> numr::error::Result<T> {
                let (y0, y1) = (y.at(0, client)?, y.at(1, client)?);
                let f0 = y0.mul_scalar(-1000.0, client)?.add(&y1, client)?;
                T::stack(&[f0, y1.neg(client)?], client)
            }
        }
        let problem = Stiff {
            params: ParamSpace::empty(),
        };
        let p = problem.make_user_data();
        let mut engine = SdirkEngine::new(2, SolverOptions::with_tolerances(1e-4, 1e-8)).unwrap();
        engine.reinit(0.0, &[1.0, 1.0]).unwrap();
        assert_eq!(run_to(&mut engine, &problem, &p, 10.0), StepStatus::Success);
        // slow manifold: y0 ≈ y1 / 999
        let y1 = (-10.0_f64).exp();
        let y0 = y1 / 999.0;
        let state = engine.state();
        assert_abs_diff_eq!(state[1], y1, epsilon = 1e-6);
        assert_abs_diff_eq!(state[0], y0, epsilon = 1e-7);
        // an explicit method would need thousands of steps
        assert!(engine.stats().n_steps < 2000, "{}", engine.stats().n_steps);
    }

    #[test]
    fn test_rhs_failure_is_reported() {
        struct Broken {
            params: ParamSpace,
        }
        impl OdeProblem for Broken {
            fn n_states(&self) -> usize {
                1
            }
            fn params(&self) -> &ParamSpace {
                &self.params
            }
            fn rhs_ad<T: AdTensor>(
                &self,
                _t: f64,
                y: &T,
                _p: &T,
                client: &CpuClient,
            ) -> numr::error::Result<T> {
                y.neg(client)
            }
            fn rhs(
                &self,
                t: f64,
                y: &[f64],
                ydot: &mut [f64],
                _p: &[f64],
            ) -> IntegrateResult<()> {
                if t > 0.5 {
                    return Err(IntegrateError::InvalidInput {
                        context: "outside domain".to_string(),
                    });
                }
                ydot[0] = -y[0];
                Ok(())
            }
        }
        let problem = Broken {
            params: ParamSpace::empty(),
        };
        let mut engine = engine(SolverOptions::default());
        engine.reinit(0.0, &[1.0]).unwrap();
        assert_eq!(
            engine.step(&problem, &[], 1.0),
            StepStatus::Failed(EngineFlag::RhsFailure)
        );
    }

    #[test]
    fn test_constraints_keep_state_non_negative() {
        // y' = -1 drives y through zero at t = 1.
        struct Ramp {
            params: ParamSpace,
        }
        impl OdeProblem for Ramp {
            fn n_states(&self) -> usize {
                1
            }
            fn params(&self) -> &ParamSpace {
                &self.params
            }
            fn rhs_ad<T: AdTensor>(
                &self,
                _t: f64,
                _y: &T,
                _p: &T,
                client: &CpuClient,
            ) -> numr::error::Result<T> {
                Ok(T::scalar(-1.0, client))
            }
        }
        let problem = Ramp {
            params: ParamSpace::empty(),
        };
        let options = SolverOptions::with_tolerances(1e-6, 1e-8).constraints(vec![1.0]);
        let mut engine = engine(options);
        engine.reinit(0.0, &[1.0]).unwrap();
        assert_eq!(engine.step(&problem, &[], 0.5), StepStatus::Success);
        assert_eq!(
            engine.step(&problem, &[], 2.0),
            StepStatus::Failed(EngineFlag::ConstraintFailure)
        );
        assert!(engine.state()[0] >= 0.0);
    }

    #[test]
    fn test_forward_sensitivity_of_decay() {
        for method in [SensitivityMethod::Simultaneous, SensitivityMethod::Staggered] {
            let problem = Decay::new(0.5);
            let p = problem.make_user_data();
            let mut engine = engine(SolverOptions::with_tolerances(1e-9, 1e-10));
            let opts = SensitivityOptions::default().with_method(method);
            engine.sens_init(1, &opts).unwrap();
            engine.reinit(0.0, &[2.0]).unwrap();
            engine.sens_reinit(&[0.0]).unwrap();
            assert_eq!(run_to(&mut engine, &problem, &p, 3.0), StepStatus::Success);
            // dy/dk = -t y0 exp(-k t)
            let expected = -3.0 * 2.0 * (-1.5_f64).exp();
            let got = engine.sensitivities()[0];
            assert_abs_diff_eq!(got, expected, epsilon = 5e-5);
        }
    }

    #[test]
    fn test_backward_pass_recovers_decay_gradient() {
        let problem = Decay::new(0.8);
        let p = problem.make_user_data();
        let mut engine = engine(SolverOptions::with_tolerances(1e-10, 1e-10));
        let opts = AdjointOptions::default()
            .with_checkpoints(7)
            .with_interpolation(crate::integrate::sensitivity::Interpolation::Hermite);
        engine.adj_init(1, &opts).unwrap();
        engine.reinit(0.0, &[1.5]).unwrap();
        engine.adj_reinit().unwrap();
        let mut status = engine.step_checkpointed(&problem, &p, 2.0);
        while status == StepStatus::TooMuchWork {
            status = engine.step_checkpointed(&problem, &p, 2.0);
        }
        assert_eq!(status, StepStatus::Success);
        assert!(engine.n_checkpoints() > 1);

        // L = y(2): lambda(2) = -1
        engine.backward_reinit(2.0, &[-1.0]).unwrap();
        engine.quad_reinit(&[0.0]).unwrap();
        let mut status = engine.step_backward(&problem, &p, 0.0);
        while status == StepStatus::TooMuchWork {
            status = engine.step_backward(&problem, &p, 0.0);
        }
        assert_eq!(status, StepStatus::Success);
        assert_eq!(engine.backward_time(), 0.0);
        let decay = (-1.6_f64).exp();
        let grad_y0 = -engine.backward_state()[0];
        let grad_k = engine.backward_quad()[0];
        assert_abs_diff_eq!(grad_y0, decay, epsilon = 1e-5);
        assert_abs_diff_eq!(grad_k, -2.0 * 1.5 * decay, epsilon = 1e-5);
        assert!(engine.stats().n_recomputed_windows > 1);
    }

    #[test]
    fn test_backward_requires_forward_pass() {
        let mut engine = engine(SolverOptions::default());
        assert!(engine.backward_reinit(0.0, &[0.0]).is_err());
        engine.adj_init(1, &AdjointOptions::default()).unwrap();
        assert!(engine.backward_reinit(0.0, &[0.0]).is_err());
        engine.reinit(0.0, &[1.0]).unwrap();
        assert!(engine.backward_reinit(0.5, &[0.0]).is_err());
        assert!(engine.quad_reinit(&[0.0, 1.0]).is_err());
    }
}
