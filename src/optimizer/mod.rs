//! Numerical layer: linearization, block normal equations, and the damped
//! Schur-complement Levenberg-Marquardt solver.

pub mod hessian;
pub mod jacobians;
pub mod robust;
pub mod solver;

pub use hessian::SparsityStats;
pub use robust::RobustKernel;
pub use solver::{
    IterationObserver, NullObserver, OptimizationResult, TerminationReason,
};
