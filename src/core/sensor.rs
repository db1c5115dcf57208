//! Sensor model capability.
//!
//! The measurement model is pluggable: the engine only requires a prediction
//! function `h(x)` for a landmark point expressed in the observer's frame and
//! its Jacobian with respect to that point. Two planar models are supplied:
//!
//! - [`Cartesian2D`]: the sensor reports the landmark position directly
//!   (identity projection, exact Jacobians). The workhorse for tests.
//! - [`RangeBearing2D`]: range + bearing, the classic 2D landmark sensor.

use nalgebra::{DMatrix, DVector};

use super::pose::{normalize_angle, Pose2D, RelativePose};

/// Capability trait for observation/sensor models.
///
/// Landmarks are relative points in their base keyframe's frame, so the
/// landmark dimensionality equals [`RelativePose::point_dims`].
pub trait SensorModel: Clone {
    /// The pose parameterization this model observes through.
    type Pose: RelativePose;

    /// Number of components in a measurement vector.
    fn obs_dims(&self) -> usize;

    /// Number of components in a landmark's relative position.
    fn landmark_dims(&self) -> usize {
        Self::Pose::point_dims()
    }

    /// Predicted measurement of a landmark at `point` in the observer frame.
    fn predict(&self, point: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of [`predict`](SensorModel::predict) with respect to the
    /// point, `obs_dims × point_dims`.
    fn jacobian_wrt_point(&self, point: &DVector<f64>) -> DMatrix<f64>;

    /// Residual `z - h`. Models with angular components override this to
    /// wrap the difference.
    fn residual(&self, measured: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        measured - predicted
    }
}

/// Direct Cartesian observation of planar landmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cartesian2D;

impl SensorModel for Cartesian2D {
    type Pose = Pose2D;

    fn obs_dims(&self) -> usize {
        2
    }

    fn predict(&self, point: &DVector<f64>) -> DVector<f64> {
        point.clone()
    }

    fn jacobian_wrt_point(&self, _point: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(2, 2)
    }
}

/// Range-bearing observation of planar landmarks.
///
/// Measurement: `z = (r, φ)` with `r = |p|`, `φ = atan2(p_y, p_x)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeBearing2D;

impl SensorModel for RangeBearing2D {
    type Pose = Pose2D;

    fn obs_dims(&self) -> usize {
        2
    }

    fn predict(&self, point: &DVector<f64>) -> DVector<f64> {
        let r = (point[0] * point[0] + point[1] * point[1]).sqrt();
        DVector::from_vec(vec![r, point[1].atan2(point[0])])
    }

    fn jacobian_wrt_point(&self, point: &DVector<f64>) -> DMatrix<f64> {
        let (x, y) = (point[0], point[1]);
        let r_sq = (x * x + y * y).max(1e-12);
        let r = r_sq.sqrt();
        DMatrix::from_row_slice(2, 2, &[x / r, y / r, -y / r_sq, x / r_sq])
    }

    fn residual(&self, measured: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![
            measured[0] - predicted[0],
            normalize_angle(measured[1] - predicted[1]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cartesian_predict_is_identity() {
        let model = Cartesian2D;
        let p = DVector::from_vec(vec![1.5, -2.0]);
        let h = model.predict(&p);
        assert_relative_eq!(h[0], 1.5);
        assert_relative_eq!(h[1], -2.0);
    }

    #[test]
    fn test_range_bearing_predict() {
        let model = RangeBearing2D;
        let p = DVector::from_vec(vec![3.0, 4.0]);
        let h = model.predict(&p);
        assert_relative_eq!(h[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(h[1], (4.0f64).atan2(3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_range_bearing_jacobian_numeric() {
        let model = RangeBearing2D;
        let p = DVector::from_vec(vec![1.2, -0.8]);
        let jac = model.jacobian_wrt_point(&p);

        let eps = 1e-7;
        for k in 0..2 {
            let mut plus = p.clone();
            let mut minus = p.clone();
            plus[k] += eps;
            minus[k] -= eps;
            let dh = (model.predict(&plus) - model.predict(&minus)) / (2.0 * eps);
            assert_relative_eq!(jac[(0, k)], dh[0], epsilon = 1e-5);
            assert_relative_eq!(jac[(1, k)], dh[1], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_range_bearing_residual_wraps() {
        let model = RangeBearing2D;
        let z = DVector::from_vec(vec![1.0, std::f64::consts::PI - 0.05]);
        let h = DVector::from_vec(vec![1.0, -std::f64::consts::PI + 0.05]);
        let r = model.residual(&z, &h);
        assert_relative_eq!(r[1].abs(), 0.1, epsilon = 1e-9);
    }
}
