//! Identifier types and ingestion records.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Keyframe identifier. Allocated sequentially, starting at 0, never reused.
pub type KeyframeId = u64;

/// External feature identifier for landmarks.
pub type LandmarkId = u64;

/// Index of a keyframe-to-keyframe edge in the edge arena.
pub type EdgeId = usize;

/// Topological distance (number of k2k edges) between two keyframes.
pub type TopoDist = u32;

/// One landmark observation handed to [`crate::RbaEngine::define_new_keyframe`].
///
/// At most one of `fixed_position` / `initial_position` may be set, and only
/// on the first observation of the landmark:
///
/// - `fixed_position`: the landmark's relative position is known exactly and
///   will never be optimized.
/// - `initial_position`: a starting estimate for an unknown-position
///   landmark, anchored to the observing keyframe.
///
/// Positions are expressed in the frame of the observing keyframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewObservation {
    /// Feature id of the observed landmark.
    pub landmark_id: LandmarkId,

    /// Raw measurement vector ("z"), in sensor-model coordinates.
    pub measurement: DVector<f64>,

    /// Known relative position (first observation only).
    pub fixed_position: Option<DVector<f64>>,

    /// Initial estimate for an unknown relative position (first observation only).
    pub initial_position: Option<DVector<f64>>,
}

impl NewObservation {
    /// Observation of a landmark with an unknown (or already known) position.
    pub fn new(landmark_id: LandmarkId, measurement: DVector<f64>) -> Self {
        Self {
            landmark_id,
            measurement,
            fixed_position: None,
            initial_position: None,
        }
    }

    /// First observation of a landmark with an exactly known relative position.
    pub fn with_fixed_position(landmark_id: LandmarkId, measurement: DVector<f64>, position: DVector<f64>) -> Self {
        Self {
            landmark_id,
            measurement,
            fixed_position: Some(position),
            initial_position: None,
        }
    }

    /// First observation of an unknown-position landmark with a starting estimate.
    pub fn with_initial_position(landmark_id: LandmarkId, measurement: DVector<f64>, position: DVector<f64>) -> Self {
        Self {
            landmark_id,
            measurement,
            fixed_position: None,
            initial_position: Some(position),
        }
    }
}
