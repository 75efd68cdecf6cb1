//! Error types for integration and sensitivity operations.

use thiserror::Error;

use crate::integrate::sensitivity::AdjointPhase;
use crate::integrate::traits::EngineFlag;

/// Result type for integration operations.
pub type IntegrateResult<T> = Result<T, IntegrateError>;

/// Errors that can occur while configuring or running a solver.
#[derive(Debug, Clone, Error)]
pub enum IntegrateError {
    /// Tolerance has the wrong shape or contains invalid values.
    #[error("Invalid tolerance in {context}: {message}")]
    InvalidTolerance { context: String, message: String },

    /// A supplied buffer does not have the declared dimension.
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    /// Unknown or unsupported coupling/interpolation mode.
    #[error("Unsupported mode '{mode}' for {context}")]
    UnsupportedMode { mode: String, context: String },

    /// A parameter path that does not exist in the parameter structure.
    #[error("Unknown parameter path '{path}'")]
    UnknownParameter { path: String },

    /// A parameter path addressed more than once.
    #[error("Parameter path '{path}' is addressed more than once")]
    DuplicateParameter { path: String },

    /// Invalid input (time grid, options, ...).
    #[error("Invalid input in {context}")]
    InvalidInput { context: String },

    /// The integration engine reported a non-retryable failure.
    #[error("Solving ode failed between time {t_start} and {t_end}: {flag}")]
    EngineFailure {
        flag: EngineFlag,
        t_start: f64,
        t_end: f64,
    },

    /// The backward pass ran out of step requests for a sub-interval.
    #[error("Too many solver retries ({retries}) between time {t_upper} and {t_lower}")]
    TooManyRetries {
        t_upper: f64,
        t_lower: f64,
        retries: usize,
    },

    /// Adjoint operation requested in the wrong phase.
    #[error("{operation} is not allowed while the adjoint solver is in phase {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: AdjointPhase,
    },

    /// Error from underlying numr operation.
    #[error("numr error: {0}")]
    NumrError(String),
}

impl IntegrateError {
    /// Whether this error came from the numerical integration itself rather
    /// than from configuration or bookkeeping.
    pub fn is_integration_failure(&self) -> bool {
        matches!(self, Self::EngineFailure { .. })
    }

    pub(crate) fn shape(what: impl Into<String>, expected: usize, got: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            got,
        }
    }
}

impl From<numr::error::Error> for IntegrateError {
    fn from(err: numr::error::Error) -> Self {
        Self::NumrError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_failure_message_names_flag_and_interval() {
        let err = IntegrateError::EngineFailure {
            flag: EngineFlag::ConvFailure,
            t_start: 0.0,
            t_end: 1.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("CV_CONV_FAILURE"), "{}", msg);
        assert!(msg.contains("-4"), "{}", msg);
        assert!(msg.contains("1.5"), "{}", msg);
        assert!(err.is_integration_failure());
    }

    #[test]
    fn test_retry_error_is_not_poisonable() {
        let err = IntegrateError::TooManyRetries {
            t_upper: 2.0,
            t_lower: 1.0,
            retries: 50,
        };
        assert!(!err.is_integration_failure());
        assert!(err.to_string().contains("between time 2 and 1"));
    }
}
