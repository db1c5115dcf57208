//! Error types for SetuRBA
//!
//! Contract violations (bad ids, conflicting landmark initialization) are
//! reported through [`RbaError`]. Numerical trouble during optimization is
//! never an `Err`: it is reported as a termination status inside
//! [`crate::optimizer::OptimizationResult`] so the caller can inspect the
//! diagnostics and decide on a retry policy.

use crate::core::types::{EdgeId, KeyframeId, LandmarkId};

/// Result type alias
pub type Result<T> = std::result::Result<T, RbaError>;

/// SetuRBA error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RbaError {
    /// Keyframe id has not been allocated
    #[error("Unknown keyframe: {0}")]
    UnknownKeyframe(KeyframeId),

    /// Edge id does not exist
    #[error("Unknown kf2kf edge: {0}")]
    UnknownEdge(EdgeId),

    /// Landmark id has never been observed
    #[error("Unknown landmark: {0}")]
    UnknownLandmark(LandmarkId),

    /// Landmark has a fixed (known) position and cannot be optimized
    #[error("Landmark {0} has a known position and is not optimizable")]
    LandmarkNotOptimizable(LandmarkId),

    /// Both a fixed and an unknown initial position were supplied at once
    #[error("Landmark {0}: fixed and initial positions are mutually exclusive")]
    ConflictingLandmarkInit(LandmarkId),

    /// A position was supplied for a landmark that is already in a table
    #[error("Landmark {0} is already initialized; positions may only accompany the first observation")]
    LandmarkAlreadyInitialized(LandmarkId),

    /// Attempted to create an edge from a keyframe to itself
    #[error("Self edge on keyframe {0}")]
    SelfEdge(KeyframeId),

    /// A supplied vector has the wrong number of components
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected number of components
        expected: usize,
        /// Actual number of components
        got: usize,
    },
}
