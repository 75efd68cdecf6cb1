//! TR-BDF2 as a three-stage ESDIRK method.
//!
//! Stage 1 is explicit (FSAL), stage 2 is a trapezoidal step to `t + γh` and
//! stage 3 a BDF2 step to `t + h`. The method is L-stable and stiffly
//! accurate. An embedded third-order solution gives the local error
//! estimate, which is filtered through the iteration matrix so that stiff
//! components do not inflate it.

use std::f64::consts::SQRT_2;

use super::step_control::wrms_norm;
use crate::integrate::traits::EngineFlag;

/// Position of the trapezoidal stage.
pub const GAMMA: f64 = 2.0 - SQRT_2;
/// Diagonal coefficient.
pub const D: f64 = GAMMA / 2.0;
/// Weight of the first two stages.
const W: f64 = SQRT_2 / 4.0;

const C: [f64; 3] = [0.0, GAMMA, 1.0];
const A: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [D, D, 0.0], [W, W, D]];
const B: [f64; 3] = [W, W, D];
const B_HAT: [f64; 3] = [(1.0 - W) / 3.0, (3.0 * W + 1.0) / 3.0, D / 3.0];

/// Stage times relative to the step start, as fractions of `h`.
pub fn stage_offsets() -> [f64; 3] {
    C
}

/// Solution weights.
pub fn weights() -> [f64; 3] {
    B
}

/// Error weights `b - b_hat`.
pub fn error_weights() -> [f64; 3] {
    [B[0] - B_HAT[0], B[1] - B_HAT[1], B[2] - B_HAT[2]]
}

/// A system of stage equations `z = ψ + h d g(t, z)`.
pub trait StageSystem {
    /// Dimension of `z`.
    fn dim(&self) -> usize;

    /// Called before the Newton iteration of stage 1 or 2.
    fn begin_stage(&mut self, _stage: usize) {}

    /// Evaluate `g(t, z)`.
    fn eval(&mut self, t: f64, z: &[f64], out: &mut [f64]) -> Result<(), EngineFlag>;

    /// Solve the iteration matrix system in place.
    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), EngineFlag>;
}

/// Newton iteration controls.
#[derive(Debug, Clone, Copy)]
pub struct NewtonControl {
    pub tol: f64,
    pub max_iter: usize,
}

/// Result of one attempted step.
#[derive(Debug, Clone)]
pub struct StageSolution {
    /// Stage values, `z[0]` is the step start.
    pub z: [Vec<f64>; 3],
    /// Stage derivatives.
    pub g: [Vec<f64>; 3],
    /// Unfiltered local error estimate `h Σ (b - b_hat) g_i`.
    pub err: Vec<f64>,
}

impl StageSolution {
    /// Solution at the end of the step.
    pub fn end(&self) -> &[f64] {
        &self.z[2]
    }
}

/// Attempt one step of size `h` (negative for backward integration).
///
/// Returns `Ok(None)` when a stage Newton iteration does not converge.
pub fn attempt_step<S: StageSystem>(
    system: &mut S,
    t: f64,
    h: f64,
    y: &[f64],
    g0: &[f64],
    weights: &[f64],
    newton: NewtonControl,
) -> Result<Option<StageSolution>, EngineFlag> {
    let m = system.dim();
    let hd = h * D;
    let mut z = [y.to_vec(), vec![0.0; m], vec![0.0; m]];
    let mut g = [g0.to_vec(), vec![0.0; m], vec![0.0; m]];

    for stage in 1..3 {
        system.begin_stage(stage);
        let psi: Vec<f64> = (0..m)
            .map(|k| y[k] + h * (0..stage).map(|j| A[stage][j] * g[j][k]).sum::<f64>())
            .collect();
        // Predictor: extrapolate the previous stage derivative.
        let mut zi: Vec<f64> = psi
            .iter()
            .zip(&g[stage - 1])
            .map(|(p, gp)| p + hd * gp)
            .collect();
        let ti = t + C[stage] * h;
        if !newton_solve(system, ti, hd, &psi, &mut zi, weights, newton)? {
            return Ok(None);
        }
        g[stage] = zi.iter().zip(&psi).map(|(zk, pk)| (zk - pk) / hd).collect();
        z[stage] = zi;
    }

    let e = error_weights();
    let err = (0..m)
        .map(|k| h * (e[0] * g[0][k] + e[1] * g[1][k] + e[2] * g[2][k]))
        .collect();
    Ok(Some(StageSolution { z, g, err }))
}

/// Simplified Newton iteration for `z - ψ - hd g(t, z) = 0`.
fn newton_solve<S: StageSystem>(
    system: &mut S,
    t: f64,
    hd: f64,
    psi: &[f64],
    z: &mut [f64],
    weights: &[f64],
    newton: NewtonControl,
) -> Result<bool, EngineFlag> {
    let m = z.len();
    let mut gz = vec![0.0; m];
    let mut delta = vec![0.0; m];
    let mut prev_norm = f64::INFINITY;

    for iter in 0..newton.max_iter {
        system.eval(t, z, &mut gz)?;
        for k in 0..m {
            delta[k] = psi[k] + hd * gz[k] - z[k];
        }
        system.solve(&mut delta)?;
        for (zk, dk) in z.iter_mut().zip(&delta) {
            *zk += dk;
        }
        let norm = wrms_norm(&delta, weights);
        if !norm.is_finite() {
            return Ok(false);
        }
        if norm <= newton.tol {
            return Ok(true);
        }
        if iter > 0 {
            let rate = norm / prev_norm;
            if rate > 0.9 {
                return Ok(false);
            }
            if rate / (1.0 - rate) * norm <= newton.tol {
                return Ok(true);
            }
        }
        prev_norm = norm;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// y' = lambda * y with the exact iteration matrix.
    struct Scalar {
        lambda: f64,
        hd: f64,
    }

    impl StageSystem for Scalar {
        fn dim(&self) -> usize {
            1
        }
        fn eval(&mut self, _t: f64, z: &[f64], out: &mut [f64]) -> Result<(), EngineFlag> {
            out[0] = self.lambda * z[0];
            Ok(())
        }
        fn solve(&mut self, rhs: &mut [f64]) -> Result<(), EngineFlag> {
            rhs[0] /= 1.0 - self.hd * self.lambda;
            Ok(())
        }
    }

    #[test]
    fn test_tableau_consistency() {
        for (row, c) in A.iter().zip(C.iter()) {
            let sum: f64 = row.iter().sum();
            assert_abs_diff_eq!(sum, *c, epsilon = 1e-15);
        }
        assert_abs_diff_eq!(B.iter().sum::<f64>(), 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(B_HAT.iter().sum::<f64>(), 1.0, epsilon = 1e-15);
        // second order conditions
        let bc: f64 = B.iter().zip(&C).map(|(b, c)| b * c).sum();
        assert_abs_diff_eq!(bc, 0.5, epsilon = 1e-15);
        // third order conditions of the embedded solution
        let bc2: f64 = B_HAT.iter().zip(&C).map(|(b, c)| b * c * c).sum();
        assert_abs_diff_eq!(bc2, 1.0 / 3.0, epsilon = 1e-14);
        let mut bac = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                bac += B_HAT[i] * A[i][j] * C[j];
            }
        }
        assert_abs_diff_eq!(bac, 1.0 / 6.0, epsilon = 1e-14);
    }

    #[test]
    fn test_step_on_linear_decay() {
        let lambda = -1.0;
        let h = 0.01;
        let mut system = Scalar { lambda, hd: h * D };
        let newton = NewtonControl {
            tol: 1e-3,
            max_iter: 4,
        };
        let sol = attempt_step(&mut system, 0.0, h, &[1.0], &[lambda], &[1e8], newton)
            .unwrap()
            .unwrap();
        let exact = (lambda * h).exp();
        assert_abs_diff_eq!(sol.end()[0], exact, epsilon = 1e-7);
        assert_abs_diff_eq!(sol.err[0], 0.0, epsilon = 1e-6);
        assert!(sol.err[0].abs() > 0.0);
    }

    #[test]
    fn test_stiff_step_is_damped() {
        let lambda = -1e6;
        let h = 1.0;
        let mut system = Scalar { lambda, hd: h * D };
        let newton = NewtonControl {
            tol: 1e-3,
            max_iter: 4,
        };
        let sol = attempt_step(&mut system, 0.0, h, &[1.0], &[lambda], &[1.0], newton)
            .unwrap()
            .unwrap();
        assert_abs_diff_eq!(sol.end()[0], 0.0, epsilon = 1e-3);
    }
}
