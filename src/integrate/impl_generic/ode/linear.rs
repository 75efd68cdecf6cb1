//! Dense Newton-system solves through numr.

use numr::ops::LinalgOps;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

use crate::integrate::error::{IntegrateError, IntegrateResult};

/// Iteration matrix `I - h d J` (or its backward counterpart) held as a numr
/// tensor.
pub struct IterationMatrix {
    n: usize,
    tensor: Tensor<CpuRuntime>,
}

impl IterationMatrix {
    pub fn dim(&self) -> usize {
        self.n
    }
}

/// Solves linear systems with the CPU runtime.
pub struct DenseLinearSolver {
    device: CpuDevice,
    client: CpuClient,
}

impl Default for DenseLinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseLinearSolver {
    pub fn new() -> Self {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        Self { device, client }
    }

    /// Build `I - scale * jac` from a row-major `n × n` Jacobian.
    pub fn iteration_matrix(&self, jac: &[f64], n: usize, scale: f64) -> IterationMatrix {
        let mut data: Vec<f64> = jac.iter().map(|v| -scale * v).collect();
        for i in 0..n {
            data[i * n + i] += 1.0;
        }
        IterationMatrix {
            n,
            tensor: Tensor::<CpuRuntime>::from_slice(&data, &[n, n], &self.device),
        }
    }

    /// Solve `M x = rhs` in place.
    pub fn solve(&self, matrix: &IterationMatrix, rhs: &mut [f64]) -> IntegrateResult<()> {
        let n = matrix.n;
        if rhs.len() != n {
            return Err(IntegrateError::shape("linear system", n, rhs.len()));
        }
        let b = Tensor::<CpuRuntime>::from_slice(rhs, &[n, 1], &self.device);
        let x = self.client.solve(&matrix.tensor, &b)?;
        let x: Vec<f64> = x.to_vec();
        if x.len() != n || x.iter().any(|v| !v.is_finite()) {
            return Err(IntegrateError::NumrError(
                "singular iteration matrix".to_string(),
            ));
        }
        rhs.copy_from_slice(&x);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_iteration_matrix_solve() {
        let solver = DenseLinearSolver::new();
        // J = [[-2, 1], [0, -3]], M = I - 0.5 J = [[2, -0.5], [0, 2.5]]
        let jac = [-2.0, 1.0, 0.0, -3.0];
        let m = solver.iteration_matrix(&jac, 2, 0.5);
        assert_eq!(m.dim(), 2);
        let mut rhs = [1.5, 5.0];
        solver.solve(&m, &mut rhs).unwrap();
        // x1 = 2, 2 x0 - 1 = 1.5
        assert_abs_diff_eq!(rhs[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rhs[0], 1.25, epsilon = 1e-12);
    }

    #[test]
    fn test_wrong_rhs_length() {
        let solver = DenseLinearSolver::new();
        let m = solver.iteration_matrix(&[0.0], 1, 1.0);
        let mut rhs = [1.0, 2.0];
        assert!(solver.solve(&m, &mut rhs).is_err());
    }
}
