//! Problem definition consumed by the solvers.

use numr::runtime::cpu::CpuClient;

use crate::integrate::error::IntegrateResult;
use crate::integrate::impl_generic::ode::jacobian::{
    adjoint_vjp, compute_jacobian_autograd, compute_param_jacobian_autograd, eval_primal,
    quadrature_vjp, sensitivity_jvp,
};
use crate::integrate::traits::AdTensor;
use crate::params::ParamSpace;

/// A parametrized ODE system `dy/dt = f(t, y, p)`.
///
/// Only [`rhs_ad`](Self::rhs_ad) is required. It is written once against
/// [`AdTensor`] and every other callback is derived from it through numr
/// autograd: Jacobians and sensitivities in forward mode, adjoint and
/// quadrature right-hand sides in reverse mode. Override [`rhs`](Self::rhs)
/// or [`jac`](Self::jac) with hand-written forms where that is cheaper.
///
/// # Layouts
///
/// - `jac`: row-major `n_states × n_states`, `jac[i * n + j] = ∂f_i/∂y_j`.
/// - `dfdp`: row-major `n_states × n_params`, `dfdp[i * np + j] = ∂f_i/∂p_j`
///   where `p_j` runs over the differentiable subset.
/// - sensitivities: `n_params` blocks of `n_states`, `sens[j * n + i] = ∂y_i/∂p_j`.
///
/// `user_data` is the full parameter buffer laid out by
/// [`params`](Self::params).
pub trait OdeProblem {
    /// Number of states.
    fn n_states(&self) -> usize;

    /// Parameter layout, differentiable subset and remainder.
    fn params(&self) -> &ParamSpace;

    /// Number of differentiable parameters.
    fn n_params(&self) -> usize {
        self.params().subset().len()
    }

    /// Fresh parameter buffer holding the defaults.
    fn make_user_data(&self) -> Vec<f64> {
        self.params().layout().make_buffer()
    }

    /// `f(t, y, p)` on differentiable values, `p` being the full parameter
    /// buffer. Must return a vector of length `n_states`.
    fn rhs_ad<T: AdTensor>(
        &self,
        t: f64,
        y: &T,
        p: &T,
        client: &CpuClient,
    ) -> numr::error::Result<T>;

    /// Evaluate `ydot = f(t, y, p)`.
    fn rhs(&self, t: f64, y: &[f64], ydot: &mut [f64], user_data: &[f64]) -> IntegrateResult<()> {
        eval_primal(self, t, y, ydot, user_data)
    }

    /// State Jacobian `∂f/∂y`.
    fn jac(&self, t: f64, y: &[f64], jac: &mut [f64], user_data: &[f64]) -> IntegrateResult<()> {
        compute_jacobian_autograd(self, t, y, jac, user_data)
    }

    /// Parameter Jacobian `∂f/∂p` over the differentiable subset.
    fn param_jac(
        &self,
        t: f64,
        y: &[f64],
        dfdp: &mut [f64],
        user_data: &[f64],
    ) -> IntegrateResult<()> {
        compute_param_jacobian_autograd(self, t, y, dfdp, user_data)
    }

    /// Sensitivity right-hand side `ds_j/dt = J s_j + ∂f/∂p_j` for all
    /// parameters at once.
    fn sensitivity_rhs(
        &self,
        t: f64,
        y: &[f64],
        _ydot: &[f64],
        sens: &[f64],
        sens_dot: &mut [f64],
        user_data: &[f64],
    ) -> IntegrateResult<()> {
        sensitivity_jvp(self, t, y, sens, sens_dot, user_data)
    }

    /// Adjoint right-hand side `dλ/dt = -Jᵀ λ`.
    fn adjoint_rhs(
        &self,
        t: f64,
        y: &[f64],
        lambda: &[f64],
        lambda_dot: &mut [f64],
        user_data: &[f64],
    ) -> IntegrateResult<()> {
        adjoint_vjp(self, t, y, lambda, lambda_dot, user_data)
    }

    /// Jacobian of [`adjoint_rhs`](Self::adjoint_rhs) with respect to `λ`,
    /// row-major `n × n`.
    fn adjoint_jac(
        &self,
        t: f64,
        y: &[f64],
        jac_b: &mut [f64],
        user_data: &[f64],
    ) -> IntegrateResult<()> {
        let n = self.n_states();
        let mut jac = vec![0.0; n * n];
        self.jac(t, y, &mut jac, user_data)?;
        for i in 0..n {
            for j in 0..n {
                jac_b[i * n + j] = -jac[j * n + i];
            }
        }
        Ok(())
    }

    /// Quadrature right-hand side `dq_j/dt = Σ_i λ_i ∂f_i/∂p_j`.
    fn adjoint_quad_rhs(
        &self,
        t: f64,
        y: &[f64],
        lambda: &[f64],
        qdot: &mut [f64],
        user_data: &[f64],
    ) -> IntegrateResult<()> {
        quadrature_vjp(self, t, y, lambda, qdot, user_data)
    }
}
