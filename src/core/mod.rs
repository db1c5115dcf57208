//! Foundation layer: identifiers, pose algebra, and sensor model capabilities.

pub mod pose;
pub mod sensor;
pub mod types;

pub use pose::{Pose2D, RelativePose};
pub use sensor::{Cartesian2D, RangeBearing2D, SensorModel};
pub use types::{EdgeId, KeyframeId, LandmarkId, NewObservation, TopoDist};
