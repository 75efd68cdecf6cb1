//! Generic implementations of the integration engine and solvers.

pub mod ode;
