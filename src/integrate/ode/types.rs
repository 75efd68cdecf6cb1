//! Types for configuring the stiff ODE solvers.

use crate::integrate::error::{IntegrateError, IntegrateResult};

/// Relative or absolute tolerance, either shared by every state or given
/// per state.
#[derive(Debug, Clone, PartialEq)]
pub enum Tolerance {
    /// One value for all states.
    Scalar(f64),
    /// One value per state.
    Vector(Vec<f64>),
}

impl Tolerance {
    /// Tolerance of state `i`.
    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        match self {
            Self::Scalar(v) => *v,
            Self::Vector(v) => v[i],
        }
    }

    /// Check the shape and values against a system with `n` states.
    pub fn validate(&self, n: usize, context: &str) -> IntegrateResult<()> {
        let values: &[f64] = match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Vector(v) => {
                if v.len() != n {
                    return Err(IntegrateError::InvalidTolerance {
                        context: context.to_string(),
                        message: format!("expected {} entries, got {}", n, v.len()),
                    });
                }
                v
            }
        };
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(IntegrateError::InvalidTolerance {
                context: context.to_string(),
                message: format!("entries must be finite and non-negative, found {}", bad),
            });
        }
        Ok(())
    }
}

impl From<f64> for Tolerance {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for Tolerance {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

/// Check that a pair of tolerances can produce finite error weights.
pub(crate) fn validate_tolerance_pair(
    rtol: &Tolerance,
    atol: &Tolerance,
    n: usize,
    context: &str,
) -> IntegrateResult<()> {
    rtol.validate(n, &format!("{} (rtol)", context))?;
    atol.validate(n, &format!("{} (atol)", context))?;
    if let Tolerance::Scalar(r) = rtol {
        if *r == 0.0 {
            return Err(IntegrateError::InvalidTolerance {
                context: context.to_string(),
                message: "scalar relative tolerance must be non-zero".to_string(),
            });
        }
    }
    for i in 0..n {
        if rtol.value(i) == 0.0 && atol.value(i) == 0.0 {
            return Err(IntegrateError::InvalidTolerance {
                context: context.to_string(),
                message: format!("rtol and atol are both zero for state {}", i),
            });
        }
    }
    Ok(())
}

/// Options for the stiff solvers.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Relative tolerance (default: 1e-10)
    pub rtol: Tolerance,

    /// Absolute tolerance (default: 1e-10)
    pub atol: Tolerance,

    /// Initial step size (default: auto-computed)
    pub h0: Option<f64>,

    /// Maximum step size (default: unbounded)
    pub max_step: Option<f64>,

    /// Accepted steps allowed per step request before the engine reports
    /// that it needs more work (default: 500)
    pub max_steps: usize,

    /// Sign constraints per state: 0 none, 1 means >= 0, -1 means <= 0,
    /// 2 means > 0, -2 means < 0. A single entry is broadcast to all states.
    pub constraints: Option<Vec<f64>>,

    /// Newton convergence threshold in the weighted RMS norm (default: 0.01)
    pub newton_tol: f64,

    /// Maximum Newton iterations per stage (default: 6)
    pub max_newton_iter: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: Tolerance::Scalar(1e-10),
            atol: Tolerance::Scalar(1e-10),
            h0: None,
            max_step: None,
            max_steps: 500,
            constraints: None,
            newton_tol: 0.01,
            max_newton_iter: 6,
        }
    }
}

impl SolverOptions {
    /// Create options with scalar tolerances.
    pub fn with_tolerances(rtol: f64, atol: f64) -> Self {
        Self {
            rtol: Tolerance::Scalar(rtol),
            atol: Tolerance::Scalar(atol),
            ..Default::default()
        }
    }

    /// Set the tolerances.
    pub fn tolerances(mut self, rtol: impl Into<Tolerance>, atol: impl Into<Tolerance>) -> Self {
        self.rtol = rtol.into();
        self.atol = atol.into();
        self
    }

    /// Set the initial step size.
    pub fn initial_step(mut self, h0: f64) -> Self {
        self.h0 = Some(h0);
        self
    }

    /// Set the maximum step size.
    pub fn max_step(mut self, h: f64) -> Self {
        self.max_step = Some(h);
        self
    }

    /// Set the number of steps per step request.
    pub fn max_steps(mut self, n: usize) -> Self {
        self.max_steps = n;
        self
    }

    /// Set sign constraints.
    pub fn constraints(mut self, constraints: Vec<f64>) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Validate all options for a system with `n` states.
    pub fn validate(&self, n: usize) -> IntegrateResult<()> {
        validate_tolerance_pair(&self.rtol, &self.atol, n, "solver options")?;
        if self.max_steps == 0 {
            return Err(IntegrateError::InvalidInput {
                context: "max_steps must be positive".to_string(),
            });
        }
        if let Some(h0) = self.h0 {
            if !(h0.is_finite() && h0 > 0.0) {
                return Err(IntegrateError::InvalidInput {
                    context: format!("initial step must be positive, got {}", h0),
                });
            }
        }
        if let Some(h) = self.max_step {
            if !(h > 0.0) {
                return Err(IntegrateError::InvalidInput {
                    context: format!("max_step must be positive, got {}", h),
                });
            }
        }
        if !(self.newton_tol > 0.0) || self.max_newton_iter == 0 {
            return Err(IntegrateError::InvalidInput {
                context: "Newton controls must be positive".to_string(),
            });
        }
        self.resolved_constraints(n).map(|_| ())
    }

    /// Constraints broadcast to `n` states, if any are set.
    pub fn resolved_constraints(&self, n: usize) -> IntegrateResult<Option<Vec<f64>>> {
        let Some(c) = &self.constraints else {
            return Ok(None);
        };
        let full = match c.len() {
            1 => vec![c[0]; n],
            len if len == n => c.clone(),
            len => return Err(IntegrateError::shape("constraints", n, len)),
        };
        if let Some(bad) = full.iter().find(|v| ![0.0, 1.0, -1.0, 2.0, -2.0].contains(*v)) {
            return Err(IntegrateError::InvalidInput {
                context: format!("constraint codes must be one of 0, ±1, ±2, found {}", bad),
            });
        }
        if full.iter().all(|v| *v == 0.0) {
            return Ok(None);
        }
        Ok(Some(full))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tolerance_combinations_accepted() {
        let n = 3;
        let scalars = [Tolerance::Scalar(1e-8), Tolerance::Vector(vec![1e-8; n])];
        for rtol in &scalars {
            for atol in &scalars {
                let opts = SolverOptions::default().tolerances(rtol.clone(), atol.clone());
                assert!(opts.validate(n).is_ok());
            }
        }
    }

    #[test]
    fn test_tolerance_vector_wrong_length() {
        let opts = SolverOptions::default().tolerances(1e-6, vec![1e-6, 1e-6]);
        assert!(matches!(
            opts.validate(3),
            Err(IntegrateError::InvalidTolerance { .. })
        ));
    }

    #[test]
    fn test_negative_tolerance_rejected() {
        let opts = SolverOptions::with_tolerances(-1e-6, 1e-6);
        assert!(opts.validate(1).is_err());
        let opts = SolverOptions::with_tolerances(0.0, 1e-6);
        assert!(opts.validate(1).is_err());
    }

    #[test]
    fn test_constraints_broadcast() {
        let opts = SolverOptions::default().constraints(vec![1.0]);
        assert_eq!(opts.resolved_constraints(3).unwrap(), Some(vec![1.0; 3]));

        let opts = SolverOptions::default().constraints(vec![0.0, 0.0]);
        assert_eq!(opts.resolved_constraints(2).unwrap(), None);

        let opts = SolverOptions::default().constraints(vec![1.0, 2.0]);
        assert!(matches!(
            opts.resolved_constraints(3),
            Err(IntegrateError::ShapeMismatch { .. })
        ));

        let opts = SolverOptions::default().constraints(vec![3.0]);
        assert!(opts.validate(1).is_err());
    }
}
