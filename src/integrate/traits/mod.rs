//! Traits connecting problems, engines and solvers.

mod autodiff;
mod engine;
mod problem;

pub use autodiff::AdTensor;
pub use engine::{
    AdjointEngine, EngineFlag, EngineStats, IntegrationEngine, SensitivityEngine, StepStatus,
};
pub use problem::OdeProblem;
