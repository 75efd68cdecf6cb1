//! Options and result types for sensitivity analysis.

mod types;

pub use types::{
    AdjointOptions, AdjointPhase, BackwardSolution, Interpolation, SensitivityMethod,
    SensitivityOptions,
};
