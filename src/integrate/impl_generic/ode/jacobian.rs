//! Exact derivatives of [`OdeProblem::rhs_ad`] through numr autograd.
//!
//! State and parameter Jacobians and the sensitivity right-hand side use
//! forward mode: one [`jvp`] per column, or [`jacobian_forward`] for the
//! full state Jacobian. The adjoint and quadrature right-hand sides are
//! vector-Jacobian products computed in reverse mode with a single
//! [`backward`] pass.
//!
//! Parameters are differentiated at the buffer offsets of the
//! differentiable subset only; the remainder is carried as constants.

use std::sync::OnceLock;

use numr::autograd::{backward, jacobian_forward, jvp, var_mul, var_sum, DualTensor, Var};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::runtime::RuntimeClient;
use numr::tensor::Tensor;

use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::traits::{AdTensor, OdeProblem};

/// Client shared by all derivative evaluations.
pub fn cpu_client() -> &'static CpuClient {
    static CLIENT: OnceLock<CpuClient> = OnceLock::new();
    CLIENT.get_or_init(|| CpuClient::new(CpuDevice::new()))
}

fn tensor(values: &[f64], client: &CpuClient) -> Tensor<CpuRuntime> {
    Tensor::<CpuRuntime>::from_slice(values, &[values.len()], client.device())
}

fn unit(n: usize, offset: usize, client: &CpuClient) -> Tensor<CpuRuntime> {
    let mut data = vec![0.0; n];
    data[offset] = 1.0;
    tensor(&data, client)
}

fn copy_checked(what: &str, values: &Tensor<CpuRuntime>, out: &mut [f64]) -> IntegrateResult<()> {
    let values: Vec<f64> = values.contiguous().to_vec();
    if values.len() != out.len() {
        return Err(IntegrateError::shape(what, out.len(), values.len()));
    }
    out.copy_from_slice(&values);
    Ok(())
}

/// Evaluate `f(t, y, p)` on plain values.
pub fn eval_primal<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    ydot: &mut [f64],
    user_data: &[f64],
) -> IntegrateResult<()> {
    let client = cpu_client();
    let y = <DualTensor<CpuRuntime> as AdTensor>::from_values(y, client);
    let p = <DualTensor<CpuRuntime> as AdTensor>::from_values(user_data, client);
    let f = problem.rhs_ad(t, &y, &p, client)?;
    copy_checked("rhs output", f.primal(), ydot)
}

/// Compute `∂f/∂y` row-major into `jac` with forward-mode AD.
pub fn compute_jacobian_autograd<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    jac: &mut [f64],
    user_data: &[f64],
) -> IntegrateResult<()> {
    let n = y.len();
    if jac.len() != n * n {
        return Err(IntegrateError::shape("jacobian", n * n, jac.len()));
    }
    let client = cpu_client();
    let p = <DualTensor<CpuRuntime> as AdTensor>::from_values(user_data, client);
    // jacobian_forward stacks columns, giving [n_out, n_in].
    let j = jacobian_forward(
        |y_dual, c| problem.rhs_ad(t, y_dual, &p, c),
        &tensor(y, client),
        client,
    )?;
    copy_checked("jacobian", &j, jac)
}

/// Compute `∂f/∂p` row-major `n_states × n_params` into `dfdp` with one
/// forward-mode product per differentiable parameter.
pub fn compute_param_jacobian_autograd<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    dfdp: &mut [f64],
    user_data: &[f64],
) -> IntegrateResult<()> {
    let n = y.len();
    let np = problem.n_params();
    if dfdp.len() != n * np {
        return Err(IntegrateError::shape("parameter jacobian", n * np, dfdp.len()));
    }
    let client = cpu_client();
    let y_t = tensor(y, client);
    let p_t = tensor(user_data, client);
    let zero_y = tensor(&vec![0.0; n], client);
    let mut column = vec![0.0; n];
    for (j, offset) in problem.params().subset().offsets().enumerate() {
        let e = unit(user_data.len(), offset, client);
        let (_, tangent) = jvp(
            |inputs: &[DualTensor<CpuRuntime>], c| problem.rhs_ad(t, &inputs[0], &inputs[1], c),
            &[&y_t, &p_t],
            &[&zero_y, &e],
            client,
        )?;
        copy_checked("parameter jacobian column", &tangent, &mut column)?;
        for i in 0..n {
            dfdp[i * np + j] = column[i];
        }
    }
    Ok(())
}

/// `ds_j/dt = J s_j + ∂f/∂p_j` for every parameter, each as one
/// Jacobian-vector product with tangent `(s_j, e_j)`.
pub fn sensitivity_jvp<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    sens: &[f64],
    sens_dot: &mut [f64],
    user_data: &[f64],
) -> IntegrateResult<()> {
    let n = y.len();
    let np = problem.n_params();
    if sens.len() != n * np || sens_dot.len() != n * np {
        return Err(IntegrateError::shape(
            "sensitivities",
            n * np,
            sens.len().min(sens_dot.len()),
        ));
    }
    let client = cpu_client();
    let y_t = tensor(y, client);
    let p_t = tensor(user_data, client);
    for (j, offset) in problem.params().subset().offsets().enumerate() {
        let s_j = tensor(&sens[j * n..(j + 1) * n], client);
        let e = unit(user_data.len(), offset, client);
        let (_, tangent) = jvp(
            |inputs: &[DualTensor<CpuRuntime>], c| problem.rhs_ad(t, &inputs[0], &inputs[1], c),
            &[&y_t, &p_t],
            &[&s_j, &e],
            client,
        )?;
        copy_checked("sensitivity rhs", &tangent, &mut sens_dot[j * n..(j + 1) * n])?;
    }
    Ok(())
}

/// Which input a vector-Jacobian product differentiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VjpInput {
    State,
    Params,
}

/// `vᵀ ∂f/∂y` or `vᵀ ∂f/∂p` (over the full parameter buffer) by reverse
/// mode. An output that does not depend on the input gives zeros.
pub fn vjp_autograd<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    v: &[f64],
    user_data: &[f64],
    wrt: VjpInput,
) -> IntegrateResult<Vec<f64>> {
    let client = cpu_client();
    let y_var = Var::new(tensor(y, client), wrt == VjpInput::State);
    let p_var = Var::new(tensor(user_data, client), wrt == VjpInput::Params);
    let f = problem.rhs_ad(t, &y_var, &p_var, client)?;
    if f.numel() != v.len() {
        return Err(IntegrateError::shape("rhs output", v.len(), f.numel()));
    }
    let weighted = var_mul(&f, &Var::new(tensor(v, client), false), client)?;
    let loss = var_sum(&weighted, &[0], false, client)?;
    let (id, len) = match wrt {
        VjpInput::State => (y_var.id(), y.len()),
        VjpInput::Params => (p_var.id(), user_data.len()),
    };
    if !loss.requires_grad() {
        return Ok(vec![0.0; len]);
    }
    let grads = backward(&loss, client)?;
    match grads.get(id) {
        Some(grad) => Ok(grad.contiguous().to_vec()),
        None => Ok(vec![0.0; len]),
    }
}

/// Adjoint right-hand side `-Jᵀ λ` as a reverse-mode product.
pub fn adjoint_vjp<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    lambda: &[f64],
    lambda_dot: &mut [f64],
    user_data: &[f64],
) -> IntegrateResult<()> {
    let grad = vjp_autograd(problem, t, y, lambda, user_data, VjpInput::State)?;
    if grad.len() != lambda_dot.len() {
        return Err(IntegrateError::shape("adjoint rhs", lambda_dot.len(), grad.len()));
    }
    for (out, g) in lambda_dot.iter_mut().zip(grad) {
        *out = -g;
    }
    Ok(())
}

/// Quadrature right-hand side `λᵀ ∂f/∂p` gathered at the differentiable
/// offsets.
pub fn quadrature_vjp<P: OdeProblem + ?Sized>(
    problem: &P,
    t: f64,
    y: &[f64],
    lambda: &[f64],
    qdot: &mut [f64],
    user_data: &[f64],
) -> IntegrateResult<()> {
    let np = problem.n_params();
    if qdot.len() != np {
        return Err(IntegrateError::shape("quadrature rhs", np, qdot.len()));
    }
    let grad = vjp_autograd(problem, t, y, lambda, user_data, VjpInput::Params)?;
    for (out, offset) in qdot.iter_mut().zip(problem.params().subset().offsets()) {
        *out = grad[offset];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamLeaf, ParamSpace, ParamTree};
    use approx::assert_abs_diff_eq;

    /// dy/dt = [k * y0^2, c * y1 - y0] with `c` held constant.
    struct Quadratic {
        params: ParamSpace,
    }

    impl OdeProblem for Quadratic {
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
            p: &T,
            client: &CpuClient,
        ) -> numr::error::Result<T> {
            // layout order: c, k
            let (c, k) = (p.at(0, client)?, p.at(1, client)?);
            let (y0, y1) = (y.at(0, client)?, y.at(1, client)?);
            let f0 = k.mul(&y0.square(client)?, client)?;
            let f1 = c.mul(&y1, client)?.sub(&y0, client)?;
            T::stack(&[f0, f1], client)
        }
    }

    fn problem() -> Quadratic {
        let defaults = ParamTree::group()
            .with("k", 3.0)
            .with("c", ParamLeaf::scalar(-2.0).constant());
        Quadratic {
            params: ParamSpace::new(&defaults, None).unwrap(),
        }
    }

    #[test]
    fn test_primal_evaluation() {
        let problem = problem();
        let p = problem.make_user_data();
        let mut ydot = [0.0; 2];
        eval_primal(&problem, 0.0, &[2.0, 1.0], &mut ydot, &p).unwrap();
        assert_eq!(ydot, [12.0, -4.0]);
    }

    #[test]
    fn test_state_jacobian() {
        let problem = problem();
        let p = problem.make_user_data();
        let y = [2.0, 1.0];
        let mut jac = [0.0; 4];
        compute_jacobian_autograd(&problem, 0.0, &y, &mut jac, &p).unwrap();
        let expected = [12.0, 0.0, -1.0, -2.0];
        for (a, b) in jac.iter().zip(&expected) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_param_jacobian_skips_remainder() {
        let problem = problem();
        assert_eq!(problem.n_params(), 1);
        let p = problem.make_user_data();
        let y = [2.0, 1.0];
        let mut dfdp = [0.0; 2];
        compute_param_jacobian_autograd(&problem, 0.0, &y, &mut dfdp, &p).unwrap();
        assert_abs_diff_eq!(dfdp[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dfdp[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reverse_mode_matches_forward_mode() {
        let problem = problem();
        let p = problem.make_user_data();
        let y = [2.0, 1.0];
        let lambda = [0.5, -1.5];
        let mut jac = [0.0; 4];
        compute_jacobian_autograd(&problem, 0.0, &y, &mut jac, &p).unwrap();

        let mut lambda_dot = [0.0; 2];
        adjoint_vjp(&problem, 0.0, &y, &lambda, &mut lambda_dot, &p).unwrap();
        for j in 0..2 {
            let expected = -(jac[j] * lambda[0] + jac[2 + j] * lambda[1]);
            assert_abs_diff_eq!(lambda_dot[j], expected, epsilon = 1e-12);
        }

        // λᵀ ∂f/∂k = 0.5 * y0^2
        let mut qdot = [0.0; 1];
        quadrature_vjp(&problem, 0.0, &y, &lambda, &mut qdot, &p).unwrap();
        assert_abs_diff_eq!(qdot[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vjp_at_stationary_point() {
        let problem = problem();
        let p = problem.make_user_data();
        // ∂f/∂k = [y0^2, 0] and ∂f/∂c = [0, y1] vanish at the origin.
        let grad = vjp_autograd(&problem, 0.0, &[0.0, 0.0], &[1.0, 1.0], &p, VjpInput::Params)
            .unwrap();
        assert_eq!(grad.len(), 2);
        for g in grad {
            assert_abs_diff_eq!(g, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_wrong_output_size() {
        let problem = problem();
        let p = problem.make_user_data();
        let mut jac = [0.0; 3];
        assert!(compute_jacobian_autograd(&problem, 0.0, &[1.0, 1.0], &mut jac, &p).is_err());
        let mut qdot = [0.0; 2];
        assert!(quadrature_vjp(&problem, 0.0, &[1.0, 1.0], &[1.0, 1.0], &mut qdot, &p).is_err());
    }
}
