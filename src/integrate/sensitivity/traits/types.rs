//! Types for forward and adjoint sensitivity analysis.

use std::fmt;
use std::str::FromStr;

use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::impl_generic::ode::Trajectory;
use crate::integrate::ode::{validate_tolerance_pair, Tolerance};

/// How sensitivities are coupled to the state during stepping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SensitivityMethod {
    /// State and sensitivities are solved as one Newton system.
    #[default]
    Simultaneous,
    /// The state stage is solved first, then the sensitivity stage.
    Staggered,
}

impl FromStr for SensitivityMethod {
    type Err = IntegrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simultaneous" => Ok(Self::Simultaneous),
            "staggered" => Ok(Self::Staggered),
            other => Err(IntegrateError::UnsupportedMode {
                mode: other.to_string(),
                context: "sensitivity method (expected 'simultaneous' or 'staggered')".to_string(),
            }),
        }
    }
}

impl fmt::Display for SensitivityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simultaneous => write!(f, "simultaneous"),
            Self::Staggered => write!(f, "staggered"),
        }
    }
}

/// Options for forward sensitivities.
#[derive(Debug, Clone, Default)]
pub struct SensitivityOptions {
    /// Coupling of state and sensitivity stages (default: simultaneous).
    pub method: SensitivityMethod,

    /// Typical magnitude of each parameter. Sensitivity `j` uses absolute
    /// tolerance `atol / |scaling_factors[j]|`. Default: all ones.
    pub scaling_factors: Option<Vec<f64>>,

    /// Exclude sensitivities from the local error test (default: false).
    pub skip_error_control: bool,
}

impl SensitivityOptions {
    /// Set the coupling method.
    pub fn with_method(mut self, method: SensitivityMethod) -> Self {
        self.method = method;
        self
    }

    /// Set per-parameter scaling factors.
    pub fn with_scaling_factors(mut self, factors: Vec<f64>) -> Self {
        self.scaling_factors = Some(factors);
        self
    }

    /// Absolute tolerance divisors, one per parameter.
    pub fn resolved_scaling(&self, n_params: usize) -> IntegrateResult<Vec<f64>> {
        match &self.scaling_factors {
            None => Ok(vec![1.0; n_params]),
            Some(f) => {
                if f.len() != n_params {
                    return Err(IntegrateError::shape("scaling factors", n_params, f.len()));
                }
                if let Some(bad) = f.iter().find(|v| !v.is_finite() || **v == 0.0) {
                    return Err(IntegrateError::InvalidInput {
                        context: format!(
                            "scaling factors must be finite and non-zero, found {}",
                            bad
                        ),
                    });
                }
                Ok(f.iter().map(|v| v.abs()).collect())
            }
        }
    }
}

/// Reconstruction of the forward trajectory between stored steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interpolation {
    /// Lagrange interpolation through the nearest stored states.
    #[default]
    Polynomial,
    /// Cubic Hermite interpolation using states and derivatives.
    Hermite,
}

impl FromStr for Interpolation {
    type Err = IntegrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polynomial" => Ok(Self::Polynomial),
            "hermite" => Ok(Self::Hermite),
            other => Err(IntegrateError::UnsupportedMode {
                mode: other.to_string(),
                context: "interpolation (expected 'polynomial' or 'hermite')".to_string(),
            }),
        }
    }
}

/// Options for the adjoint solver.
#[derive(Debug, Clone)]
pub struct AdjointOptions {
    /// Accepted forward steps between checkpoints (default: 500).
    pub n_checkpoints: usize,

    /// Forward trajectory reconstruction (default: polynomial).
    pub interpolation: Interpolation,

    /// Step requests per backward sub-interval (default: 50).
    pub max_retries: usize,

    /// Relative tolerance of the adjoint (default: 1e-10).
    pub backward_rtol: Tolerance,

    /// Absolute tolerance of the adjoint (default: 1e-10).
    pub backward_atol: Tolerance,

    /// Relative tolerance of the quadrature (default: 1e-10).
    pub quad_rtol: f64,

    /// Absolute tolerance of the quadrature (default: 1e-10).
    pub quad_atol: f64,

    /// Include the quadrature in the backward error test (default: true).
    pub quad_error_control: bool,

    /// Accepted backward steps per step request (default: 500).
    pub backward_max_steps: usize,
}

impl Default for AdjointOptions {
    fn default() -> Self {
        Self {
            n_checkpoints: 500,
            interpolation: Interpolation::Polynomial,
            max_retries: 50,
            backward_rtol: Tolerance::Scalar(1e-10),
            backward_atol: Tolerance::Scalar(1e-10),
            quad_rtol: 1e-10,
            quad_atol: 1e-10,
            quad_error_control: true,
            backward_max_steps: 500,
        }
    }
}

impl AdjointOptions {
    /// Set the checkpoint spacing.
    pub fn with_checkpoints(mut self, n: usize) -> Self {
        self.n_checkpoints = n;
        self
    }

    /// Set the interpolation.
    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Set the retry budget per backward sub-interval.
    pub fn with_max_retries(mut self, n: usize) -> Self {
        self.max_retries = n;
        self
    }

    /// Set adjoint tolerances.
    pub fn with_backward_tolerances(
        mut self,
        rtol: impl Into<Tolerance>,
        atol: impl Into<Tolerance>,
    ) -> Self {
        self.backward_rtol = rtol.into();
        self.backward_atol = atol.into();
        self
    }

    /// Set quadrature tolerances.
    pub fn with_quad_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.quad_rtol = rtol;
        self.quad_atol = atol;
        self
    }

    /// Set the backward work limit per step request.
    pub fn with_backward_max_steps(mut self, n: usize) -> Self {
        self.backward_max_steps = n;
        self
    }

    pub fn validate(&self, n_states: usize) -> IntegrateResult<()> {
        if self.n_checkpoints == 0 || self.max_retries == 0 || self.backward_max_steps == 0 {
            return Err(IntegrateError::InvalidInput {
                context: "checkpoint spacing, retries and backward max_steps must be positive"
                    .to_string(),
            });
        }
        validate_tolerance_pair(
            &self.backward_rtol,
            &self.backward_atol,
            n_states,
            "adjoint options",
        )?;
        validate_tolerance_pair(
            &Tolerance::Scalar(self.quad_rtol),
            &Tolerance::Scalar(self.quad_atol),
            1,
            "quadrature options",
        )
    }
}

/// Lifecycle of an adjoint solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjointPhase {
    /// No usable forward pass.
    Idle,
    /// A forward pass is running or has completed.
    ForwardPass,
    /// The backward pass is running.
    BackwardPass,
    /// The backward pass completed.
    Done,
    /// A pass failed; a new forward pass is required.
    Failed,
}

/// Result of a backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardSolution {
    /// Gradient of the loss with respect to the differentiable parameters.
    pub grad_params: Vec<f64>,
    /// Adjoint at the initial time.
    pub lambda: Vec<f64>,
    /// Adjoint after the injection at each output time.
    pub lambda_all: Option<Trajectory>,
    /// Quadrature at each output time.
    pub quad_all: Option<Trajectory>,
}

impl BackwardSolution {
    /// Gradient of the loss with respect to the initial state.
    pub fn grad_y0(&self) -> Vec<f64> {
        self.lambda.iter().map(|v| -v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!(
            "simultaneous".parse::<SensitivityMethod>().unwrap(),
            SensitivityMethod::Simultaneous
        );
        assert_eq!(
            "staggered".parse::<SensitivityMethod>().unwrap(),
            SensitivityMethod::Staggered
        );
        assert!(matches!(
            "staggered1".parse::<SensitivityMethod>(),
            Err(IntegrateError::UnsupportedMode { .. })
        ));
        assert!("implicit".parse::<SensitivityMethod>().is_err());
    }

    #[test]
    fn test_interpolation_parsing() {
        assert_eq!("hermite".parse::<Interpolation>().unwrap(), Interpolation::Hermite);
        assert_eq!(
            "polynomial".parse::<Interpolation>().unwrap(),
            Interpolation::Polynomial
        );
        assert!(matches!(
            "spline".parse::<Interpolation>(),
            Err(IntegrateError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn test_scaling_factors_validated() {
        let opts = SensitivityOptions::default();
        assert_eq!(opts.resolved_scaling(2).unwrap(), vec![1.0, 1.0]);

        let opts = SensitivityOptions::default().with_scaling_factors(vec![-2.0, 0.5]);
        assert_eq!(opts.resolved_scaling(2).unwrap(), vec![2.0, 0.5]);
        assert!(matches!(
            opts.resolved_scaling(3),
            Err(IntegrateError::ShapeMismatch { .. })
        ));

        let opts = SensitivityOptions::default().with_scaling_factors(vec![0.0]);
        assert!(opts.resolved_scaling(1).is_err());
    }

    #[test]
    fn test_adjoint_options_defaults() {
        let opts = AdjointOptions::default();
        assert_eq!(opts.n_checkpoints, 500);
        assert_eq!(opts.max_retries, 50);
        assert!(opts.validate(3).is_ok());
        assert!(opts.clone().with_max_retries(0).validate(3).is_err());
        let bad = opts.with_backward_tolerances(1e-8, vec![1e-8; 2]);
        assert!(matches!(
            bad.validate(3),
            Err(IntegrateError::InvalidTolerance { .. })
        ));
    }

    #[test]
    fn test_grad_y0_negates_lambda() {
        let sol = BackwardSolution {
            grad_params: vec![],
            lambda: vec![1.0, -2.0],
            lambda_all: None,
            quad_all: None,
        };
        assert_eq!(sol.grad_y0(), vec![-1.0, 2.0]);
    }
}
