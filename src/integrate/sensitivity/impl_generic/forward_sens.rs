//! Forward sensitivities: the state and `∂y/∂p` for every differentiable
//! parameter, sampled at the requested times.

use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::impl_generic::ode::{
    step_until, tensor_values, validate_time_grid, SdirkEngine, SensitivityTrajectory,
    Trajectory,
};
use crate::integrate::ode::SolverOptions;
use crate::integrate::sensitivity::traits::SensitivityOptions;
use crate::integrate::traits::{EngineStats, OdeProblem, SensitivityEngine};
use crate::params::{ParamAccess, ParamSpace};

/// Forward solver carrying sensitivities with respect to the differentiable
/// parameter subset.
pub struct SensitivitySolver<P: OdeProblem, E: SensitivityEngine = SdirkEngine> {
    problem: P,
    user_data: Vec<f64>,
    engine: E,
}

impl<P: OdeProblem> SensitivitySolver<P> {
    pub fn new(
        problem: P,
        options: SolverOptions,
        sens_options: SensitivityOptions,
    ) -> IntegrateResult<Self> {
        let engine = SdirkEngine::new(problem.n_states(), options)?;
        Self::with_engine(problem, engine, &sens_options)
    }
}

impl<P: OdeProblem, E: SensitivityEngine> SensitivitySolver<P, E> {
    /// Create a solver around an existing engine, enabling sensitivities on it.
    pub fn with_engine(
        problem: P,
        mut engine: E,
        sens_options: &SensitivityOptions,
    ) -> IntegrateResult<Self> {
        if engine.n_states() != problem.n_states() {
            return Err(IntegrateError::shape(
                "engine states",
                problem.n_states(),
                engine.n_states(),
            ));
        }
        engine.sens_init(problem.n_params(), sens_options)?;
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

    pub fn n_params(&self) -> usize {
        self.problem.n_params()
    }

    pub fn make_output_buffers(&self, n_times: usize) -> (Trajectory, SensitivityTrajectory) {
        (
            Trajectory::zeros(n_times, self.n_states()),
            SensitivityTrajectory::zeros(n_times, self.n_params(), self.n_states()),
        )
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Solve from `(t0, y0)` with initial sensitivities `sens0`
    /// (`sens0[j * n_states + i] = ∂y_i(t0)/∂p_j`).
    pub fn solve(
        &mut self,
        t0: f64,
        tvals: &[f64],
        y0: &[f64],
        sens0: &[f64],
    ) -> IntegrateResult<(Trajectory, SensitivityTrajectory)> {
        let (mut traj, mut sens) = self.make_output_buffers(tvals.len());
        self.solve_into(t0, tvals, y0, sens0, &mut traj, &mut sens)?;
        Ok((traj, sens))
    }

    /// [`solve`](Self::solve) on numr tensors. `sens0` is
    /// `[n_params, n_states]`; the outputs are `[tvals.len(), n_states]` and
    /// `[tvals.len(), n_params, n_states]`.
    pub fn solve_tensor(
        &mut self,
        t0: f64,
        tvals: &Tensor<CpuRuntime>,
        y0: &Tensor<CpuRuntime>,
        sens0: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let times = tensor_values("output times", tvals, 1)?;
        let state = tensor_values("initial state", y0, 1)?;
        let sens = tensor_values("initial sensitivities", sens0, 2)?;
        if sens0.shape()[0] != self.n_params() {
            return Err(IntegrateError::shape(
                "initial sensitivity rows",
                self.n_params(),
                sens0.shape()[0],
            ));
        }
        let (traj, sens) = self.solve(t0, &times, &state, &sens)?;
        Ok((traj.to_tensor(y0.device()), sens.to_tensor(y0.device())))
    }

    pub fn solve_into(
        &mut self,
        t0: f64,
        tvals: &[f64],
        y0: &[f64],
        sens0: &[f64],
        out: &mut Trajectory,
        sens_out: &mut SensitivityTrajectory,
    ) -> IntegrateResult<()> {
        let n = self.n_states();
        let np = self.n_params();
        validate_time_grid(t0, tvals)?;
        if y0.len() != n {
            return Err(IntegrateError::shape("initial state", n, y0.len()));
        }
        if sens0.len() != n * np {
            return Err(IntegrateError::shape("initial sensitivities", n * np, sens0.len()));
        }
        if out.n_times() != tvals.len() || out.n_states() != n {
            return Err(IntegrateError::shape(
                "output rows",
                tvals.len() * n,
                out.n_times() * out.n_states(),
            ));
        }
        if sens_out.n_times() != tvals.len()
            || sens_out.n_params() != np
            || sens_out.n_states() != n
        {
            return Err(IntegrateError::shape(
                "sensitivity output",
                tvals.len() * np * n,
                sens_out.as_slice().len(),
            ));
        }

        self.engine.reinit(t0, y0)?;
        self.engine.sens_reinit(sens0)?;
        let Self {
            problem,
            user_data,
            engine,
        } = self;
        for (i, &t) in tvals.iter().enumerate() {
            if t == t0 {
                out.row_mut(i).copy_from_slice(y0);
                sens_out.block_mut(i).copy_from_slice(sens0);
                continue;
            }
            let t_start = engine.time();
            step_until(t_start, t, || engine.step(&*problem, &user_data[..], t))?;
            out.row_mut(i).copy_from_slice(engine.state());
            sens_out.block_mut(i).copy_from_slice(engine.sensitivities());
        }
        Ok(())
    }
}

impl<P: OdeProblem, E: SensitivityEngine> ParamAccess for SensitivitySolver<P, E> {
    fn param_parts(&mut self) -> (&ParamSpace, &mut [f64]) {
        (self.problem.params(), &mut self.user_data)
    }

    fn param_view(&self) -> (&ParamSpace, &[f64]) {
        (self.problem.params(), &self.user_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::sensitivity::traits::SensitivityMethod;
    use crate::integrate::test_problems::{Chain, Decay};
    use approx::assert_abs_diff_eq;
    use numr::dtype::DType;
    use numr::runtime::cpu::CpuDevice;

    fn options(method: SensitivityMethod) -> SensitivityOptions {
        SensitivityOptions::default().with_method(method)
    }

    #[test]
    fn test_chain_sensitivities_match_closed_form() {
        let (a, b) = (1.2, 0.5);
        let y0 = [1.0, 0.4];
        let tvals = [0.0, 0.5, 2.0];
        for method in [SensitivityMethod::Simultaneous, SensitivityMethod::Staggered] {
            let mut solver = SensitivitySolver::new(
                Chain::new(a, b, None),
                SolverOptions::default(),
                options(method),
            )
            .unwrap();
            assert_eq!(solver.n_params(), 2);
            let (traj, sens) = solver.solve(0.0, &tvals, &y0, &[0.0; 4]).unwrap();
            for (i, &t) in tvals.iter().enumerate() {
                let (y, dy_da, dy_db) = Chain::exact(a, b, y0, t);
                for k in 0..2 {
                    assert_abs_diff_eq!(traj.row(i)[k], y[k], epsilon = 1e-5);
                    assert_abs_diff_eq!(sens.get(i, 0, k), dy_da[k], epsilon = 1e-5);
                    assert_abs_diff_eq!(sens.get(i, 1, k), dy_db[k], epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_tensor_solve_matches_slice_solve() {
        let mut solver = SensitivitySolver::new(
            Chain::new(1.2, 0.5, None),
            SolverOptions::default(),
            SensitivityOptions::default(),
        )
        .unwrap();
        let device = CpuDevice::new();
        let tvals = Tensor::<CpuRuntime>::from_slice(&[0.5, 2.0], &[2], &device);
        let y0 = Tensor::<CpuRuntime>::from_slice(&[1.0, 0.4], &[2], &device);
        let sens0 = Tensor::<CpuRuntime>::zeros(&[2, 2], DType::F64, &device);
        let (traj_t, sens_t) = solver.solve_tensor(0.0, &tvals, &y0, &sens0).unwrap();
        assert_eq!(traj_t.shape().to_vec(), vec![2, 2]);
        assert_eq!(sens_t.shape().to_vec(), vec![2, 2, 2]);
        let (traj, sens) = solver.solve(0.0, &[0.5, 2.0], &[1.0, 0.4], &[0.0; 4]).unwrap();
        assert_eq!(traj_t.to_vec::<f64>(), traj.as_slice().to_vec());
        assert_eq!(sens_t.to_vec::<f64>(), sens.as_slice().to_vec());

        let flat = Tensor::<CpuRuntime>::zeros(&[4], DType::F64, &device);
        assert!(solver.solve_tensor(0.0, &tvals, &y0, &flat).is_err());
        let wide = Tensor::<CpuRuntime>::zeros(&[1, 4], DType::F64, &device);
        assert!(solver.solve_tensor(0.0, &tvals, &y0, &wide).is_err());
    }

    #[test]
    fn test_first_row_is_initial_sensitivities() {
        let mut solver = SensitivitySolver::new(
            Decay::new(0.5),
            SolverOptions::default(),
            SensitivityOptions::default(),
        )
        .unwrap();
        let (traj, sens) = solver.solve(0.0, &[0.0, 1.0], &[2.0], &[0.25]).unwrap();
        assert_eq!(traj.row(0), &[2.0]);
        assert_eq!(sens.block(0), &[0.25]);
        // s' = -k s - y with s(0) = 0.25
        let expected = (0.25 - 2.0) * (-0.5_f64).exp();
        assert_abs_diff_eq!(sens.get(1, 0, 0), expected, epsilon = 1e-5);
    }

    #[test]
    fn test_subset_selects_columns() {
        let (a, b) = (1.2, 0.5);
        let problem = Chain::new(a, b, Some(&["rates.b"][..]));
        let mut solver = SensitivitySolver::new(
            problem,
            SolverOptions::default(),
            SensitivityOptions::default(),
        )
        .unwrap();
        assert_eq!(solver.n_params(), 1);
        let (_, sens) = solver.solve(0.0, &[1.5], &[1.0, 0.0], &[0.0, 0.0]).unwrap();
        let (_, _, dy_db) = Chain::exact(a, b, [1.0, 0.0], 1.5);
        assert_abs_diff_eq!(sens.get(0, 0, 1), dy_db[1], epsilon = 1e-5);
        assert_abs_diff_eq!(sens.get(0, 0, 0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_tolerances_still_converge() {
        let opts = SensitivityOptions::default().with_scaling_factors(vec![10.0, 0.1]);
        let (a, b) = (0.8, 2.0);
        let mut solver =
            SensitivitySolver::new(Chain::new(a, b, None), SolverOptions::default(), opts).unwrap();
        let (_, sens) = solver.solve(0.0, &[1.0], &[1.0, 1.0], &[0.0; 4]).unwrap();
        let (_, dy_da, _) = Chain::exact(a, b, [1.0, 1.0], 1.0);
        assert_abs_diff_eq!(sens.get(0, 0, 1), dy_da[1], epsilon = 1e-5);
    }

    #[test]
    fn test_configuration_errors() {
        assert!("staggered1".parse::<SensitivityMethod>().is_err());
        let bad_scaling = SensitivityOptions::default().with_scaling_factors(vec![1.0]);
        assert!(matches!(
            SensitivitySolver::new(
                Chain::new(1.0, 2.0, None),
                SolverOptions::default(),
                bad_scaling
            ),
            Err(IntegrateError::ShapeMismatch { .. })
        ));

        let mut solver = SensitivitySolver::new(
            Decay::new(1.0),
            SolverOptions::default(),
            SensitivityOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            solver.solve(0.0, &[1.0], &[1.0], &[0.0, 0.0]),
            Err(IntegrateError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_repeated_solves_are_independent() {
        let mut solver = SensitivitySolver::new(
            Chain::new(1.0, 2.0, None),
            SolverOptions::default(),
            SensitivityOptions::default(),
        )
        .unwrap();
        let tvals = [0.5, 2.0];
        let y0 = [1.0, 0.0];
        let first = solver.solve(0.0, &tvals, &y0, &[0.0; 4]).unwrap();
        solver.set_derivative_params(&[0.3, 0.9]).unwrap();
        let other = solver.solve(0.0, &tvals, &y0, &[0.0; 4]).unwrap();
        solver.set_derivative_params(&[1.0, 2.0]).unwrap();
        let again = solver.solve(0.0, &tvals, &y0, &[0.0; 4]).unwrap();
        assert_eq!(first, again);
        assert_ne!(first.1, other.1);
    }
}
