//! Forward and adjoint sensitivity solvers.

pub mod adjoint_ode;
pub mod checkpointing;
pub mod forward_sens;

pub use adjoint_ode::AdjointSolver;
pub use checkpointing::{Checkpoint, CheckpointManager, DensePoint, DenseWindow};
pub use forward_sens::SensitivitySolver;
