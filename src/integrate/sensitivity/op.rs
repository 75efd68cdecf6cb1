//! Value-semantics wrappers around the stateful solvers.
//!
//! An operator is configured once with an initial time and output times.
//! Each call takes the initial state and both parameter vectors as
//! one-dimensional numr tensors, loads them into the solver and returns fresh
//! tensors, so results never depend on earlier calls.

use numr::ops::{BinaryOps, ReduceOps};
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::impl_generic::ode::jacobian::cpu_client;
use crate::integrate::impl_generic::ode::{
    tensor_values, validate_time_grid, SdirkEngine, Trajectory,
};
use crate::integrate::sensitivity::impl_generic::{AdjointSolver, SensitivitySolver};
use crate::integrate::traits::{AdjointEngine, OdeProblem, SensitivityEngine};
use crate::params::ParamAccess;

/// Gradients of a loss with respect to the inputs of [`AdjointOp::forward`].
#[derive(Debug, Clone)]
pub struct AdjointGradients {
    /// `[n_states]`
    pub y0: Tensor<CpuRuntime>,
    /// `[n_params]`
    pub params: Tensor<CpuRuntime>,
}

impl AdjointGradients {
    fn poisoned(n_states: usize, n_params: usize, device: &CpuDevice) -> Self {
        Self {
            y0: Tensor::<CpuRuntime>::from_slice(&vec![f64::NAN; n_states], &[n_states], device),
            params: Tensor::<CpuRuntime>::from_slice(
                &vec![f64::NAN; n_params],
                &[n_params],
                device,
            ),
        }
    }
}

struct Inputs {
    y0: Vec<f64>,
    params: Vec<f64>,
    params_fixed: Vec<f64>,
}

impl Inputs {
    fn read(
        y0: &Tensor<CpuRuntime>,
        params: &Tensor<CpuRuntime>,
        params_fixed: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<Self> {
        Ok(Self {
            y0: tensor_values("initial state", y0, 1)?,
            params: tensor_values("params", params, 1)?,
            params_fixed: tensor_values("params_fixed", params_fixed, 1)?,
        })
    }
}

/// Solution at fixed output times with adjoint gradients.
///
/// Integration failures do not abort the caller: the outputs of the failed
/// call are filled with NaN and the failure is logged. Configuration errors
/// are returned.
pub struct AdjointOp<P: OdeProblem, E: AdjointEngine = SdirkEngine> {
    solver: AdjointSolver<P, E>,
    t0: f64,
    tvals: Vec<f64>,
}

impl<P: OdeProblem, E: AdjointEngine> AdjointOp<P, E> {
    pub fn new(solver: AdjointSolver<P, E>, t0: f64, tvals: Vec<f64>) -> IntegrateResult<Self> {
        validate_time_grid(t0, &tvals)?;
        Ok(Self { solver, t0, tvals })
    }

    pub fn solver(&self) -> &AdjointSolver<P, E> {
        &self.solver
    }

    pub fn tvals(&self) -> &[f64] {
        &self.tvals
    }

    fn load(&mut self, inputs: &Inputs) -> IntegrateResult<()> {
        self.solver.set_derivative_params(&inputs.params)?;
        self.solver.set_remaining_params(&inputs.params_fixed)
    }

    /// States at the output times, `[tvals.len(), n_states]`.
    pub fn forward(
        &mut self,
        y0: &Tensor<CpuRuntime>,
        params: &Tensor<CpuRuntime>,
        params_fixed: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<Tensor<CpuRuntime>> {
        let inputs = Inputs::read(y0, params, params_fixed)?;
        self.load(&inputs)?;
        let traj = match self.solver.solve_forward(self.t0, &self.tvals, &inputs.y0) {
            Err(err) if err.is_integration_failure() => {
                log::warn!("Forward solve failed, returning NaN: {}", err);
                let mut out = self.solver.make_output_buffers(self.tvals.len());
                out.fill(f64::NAN);
                out
            }
            result => result?,
        };
        Ok(traj.to_tensor(y0.device()))
    }

    /// Vector-Jacobian product of [`forward`](Self::forward): gradients of
    /// `Σ_i grads[i] · y(tvals[i])` for `grads` of shape
    /// `[tvals.len(), n_states]`.
    pub fn backward(
        &mut self,
        y0: &Tensor<CpuRuntime>,
        params: &Tensor<CpuRuntime>,
        params_fixed: &Tensor<CpuRuntime>,
        grads: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<AdjointGradients> {
        let n = self.solver.n_states();
        let np = self.solver.n_params();
        let grads = Trajectory::from_tensor(grads)?;
        if grads.n_times() != self.tvals.len() || grads.n_states() != n {
            return Err(IntegrateError::shape(
                "gradient rows",
                self.tvals.len() * n,
                grads.n_times() * grads.n_states(),
            ));
        }
        let inputs = Inputs::read(y0, params, params_fixed)?;
        self.load(&inputs)?;
        let tend = self.tvals.last().copied().unwrap_or(self.t0);
        let result = self
            .solver
            .solve_forward(self.t0, &self.tvals, &inputs.y0)
            .and_then(|_| {
                self.solver
                    .solve_backward(self.t0, tend, &self.tvals, &grads)
            });
        let device = y0.device();
        match result {
            Ok(solution) => Ok(AdjointGradients {
                y0: Tensor::<CpuRuntime>::from_slice(&solution.grad_y0(), &[n], device),
                params: Tensor::<CpuRuntime>::from_slice(&solution.grad_params, &[np], device),
            }),
            Err(err) if err.is_integration_failure() => {
                log::warn!("Adjoint solve failed, returning NaN gradients: {}", err);
                Ok(AdjointGradients::poisoned(n, np, device))
            }
            Err(err) => Err(err),
        }
    }
}

/// Solution and forward sensitivities at fixed output times.
pub struct ForwardSensitivityOp<P: OdeProblem, E: SensitivityEngine = SdirkEngine> {
    solver: SensitivitySolver<P, E>,
    t0: f64,
    tvals: Vec<f64>,
}

impl<P: OdeProblem, E: SensitivityEngine> ForwardSensitivityOp<P, E> {
    pub fn new(solver: SensitivitySolver<P, E>, t0: f64, tvals: Vec<f64>) -> IntegrateResult<Self> {
        validate_time_grid(t0, &tvals)?;
        Ok(Self { solver, t0, tvals })
    }

    pub fn solver(&self) -> &SensitivitySolver<P, E> {
        &self.solver
    }

    /// States `[T, n_states]` and sensitivities `[T, n_params, n_states]`,
    /// starting from zero sensitivities.
    pub fn perform(
        &mut self,
        y0: &Tensor<CpuRuntime>,
        params: &Tensor<CpuRuntime>,
        params_fixed: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let inputs = Inputs::read(y0, params, params_fixed)?;
        self.solver.set_derivative_params(&inputs.params)?;
        self.solver.set_remaining_params(&inputs.params_fixed)?;
        let sens0 = vec![0.0; self.solver.n_params() * self.solver.n_states()];
        let (traj, sens) = self.solver.solve(self.t0, &self.tvals, &inputs.y0, &sens0)?;
        Ok((traj.to_tensor(y0.device()), sens.to_tensor(y0.device())))
    }

    /// `v_j = Σ_t Σ_i g[t, i] ∂y_i(t)/∂p_j` for `sens` of shape
    /// `[T, n_params, n_states]` and `g` of shape `[T, n_states]`.
    pub fn vjp(
        sens: &Tensor<CpuRuntime>,
        g: &Tensor<CpuRuntime>,
    ) -> IntegrateResult<Tensor<CpuRuntime>> {
        let (ss, gs) = (sens.shape(), g.shape());
        if ss.len() != 3 || gs.len() != 2 || gs[0] != ss[0] || gs[1] != ss[2] {
            return Err(IntegrateError::InvalidInput {
                context: format!(
                    "output gradient of shape {:?} does not match sensitivities {:?}",
                    gs, ss
                ),
            });
        }
        let client = cpu_client();
        let g = g.contiguous().reshape(&[gs[0], 1, gs[1]])?;
        let weighted = client.mul(&sens.contiguous(), &g)?;
        Ok(client.sum(&weighted, &[0, 2], false)?)
    }
}
