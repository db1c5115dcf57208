//! Pose algebra capability.
//!
//! The engine never commits to a particular pose parameterization: everything
//! it needs from SE(2)/SE(3) is collected in the [`RelativePose`] trait.
//! A concrete SE(2) implementation, [`Pose2D`], is provided; a 3D
//! parameterization plugs in through the same trait.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Capability trait for relative-pose parameterizations.
///
/// A pose `T` is the transform of one keyframe's frame expressed in another:
/// `T_a_from_b` maps points in frame `b` into frame `a`. Composition follows
/// the usual chain `T_a_from_c = T_a_from_b ∘ T_b_from_c`.
///
/// Increments are applied on the right: an update `δ` of dimension [`dof`]
/// moves `T` to `T ∘ exp(δ)`. [`increment_jacobian`] must be the derivative
/// of `exp(δ) · p` with respect to `δ` at `δ = 0`, so that the analytical
/// Jacobians and [`retract`] agree on the parameterization.
///
/// [`dof`]: RelativePose::dof
/// [`increment_jacobian`]: RelativePose::increment_jacobian
/// [`retract`]: RelativePose::retract
pub trait RelativePose: Copy + Clone + std::fmt::Debug + PartialEq + 'static {
    /// Degrees of freedom of the pose unknown (3 for SE(2), 6 for SE(3)).
    fn dof() -> usize;

    /// Dimensionality of the points this pose acts on (2 or 3).
    fn point_dims() -> usize;

    /// The identity transform.
    fn identity() -> Self;

    /// Composition: `self ∘ other`.
    fn compose(&self, other: &Self) -> Self;

    /// Inverse transform.
    fn inverse(&self) -> Self;

    /// Map a point from the source frame into the destination frame.
    fn transform_point(&self, point: &DVector<f64>) -> DVector<f64>;

    /// The linear (rotation) part of the transform, `point_dims × point_dims`.
    fn linear_part(&self) -> DMatrix<f64>;

    /// `∂(exp(δ) · p) / ∂δ` at `δ = 0`, a `point_dims × dof` matrix.
    fn increment_jacobian(point: &DVector<f64>) -> DMatrix<f64>;

    /// Apply an increment on the right: `self ∘ exp(delta)`.
    ///
    /// `delta` must have [`dof`](RelativePose::dof) components.
    fn retract(&self, delta: &[f64]) -> Self;
}

/// A relative SE(2) pose: planar translation plus heading.
///
/// Theta is normalized to [-π, π].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    /// X translation in meters
    pub x: f64,
    /// Y translation in meters
    pub y: f64,
    /// Heading in radians, normalized to [-π, π]
    pub theta: f64,
}

impl Pose2D {
    /// Create a new pose with theta normalized to [-π, π].
    #[inline]
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
        }
    }
}

impl Default for Pose2D {
    fn default() -> Self {
        <Self as RelativePose>::identity()
    }
}

impl RelativePose for Pose2D {
    #[inline]
    fn dof() -> usize {
        3
    }

    #[inline]
    fn point_dims() -> usize {
        2
    }

    #[inline]
    fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
        }
    }

    /// Compose two poses: self ⊕ other
    ///
    /// ```text
    /// C = A ⊕ B:
    ///   C.x = A.x + B.x * cos(A.θ) - B.y * sin(A.θ)
    ///   C.y = A.y + B.x * sin(A.θ) + B.y * cos(A.θ)
    ///   C.θ = normalize(A.θ + B.θ)
    /// ```
    #[inline]
    fn compose(&self, other: &Self) -> Self {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2D::new(
            self.x + other.x * cos_t - other.y * sin_t,
            self.y + other.x * sin_t + other.y * cos_t,
            self.theta + other.theta,
        )
    }

    /// Inverse of this pose.
    ///
    /// ```text
    /// A⁻¹:
    ///   x = -A.x * cos(A.θ) - A.y * sin(A.θ)
    ///   y =  A.x * sin(A.θ) - A.y * cos(A.θ)
    ///   θ = -A.θ
    /// ```
    #[inline]
    fn inverse(&self) -> Self {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2D::new(
            -self.x * cos_t - self.y * sin_t,
            self.x * sin_t - self.y * cos_t,
            -self.theta,
        )
    }

    #[inline]
    fn transform_point(&self, point: &DVector<f64>) -> DVector<f64> {
        let (sin_t, cos_t) = self.theta.sin_cos();
        DVector::from_vec(vec![
            self.x + point[0] * cos_t - point[1] * sin_t,
            self.y + point[0] * sin_t + point[1] * cos_t,
        ])
    }

    fn linear_part(&self) -> DMatrix<f64> {
        let (sin_t, cos_t) = self.theta.sin_cos();
        DMatrix::from_row_slice(2, 2, &[cos_t, -sin_t, sin_t, cos_t])
    }

    fn increment_jacobian(point: &DVector<f64>) -> DMatrix<f64> {
        // exp(δ)·p ≈ p + (δx, δy) + δθ·(-p_y, p_x)
        DMatrix::from_row_slice(2, 3, &[1.0, 0.0, -point[1], 0.0, 1.0, point[0]])
    }

    #[inline]
    fn retract(&self, delta: &[f64]) -> Self {
        debug_assert_eq!(delta.len(), 3);
        self.compose(&Pose2D::new(delta[0], delta[1], delta[2]))
    }
}

/// Normalize angle to [-π, π].
#[inline]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle;
    while a > std::f64::consts::PI {
        a -= 2.0 * std::f64::consts::PI;
    }
    while a < -std::f64::consts::PI {
        a += 2.0 * std::f64::consts::PI;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_pose_compose_identity() {
        let p = Pose2D::new(1.0, 2.0, 0.5);
        let identity = <Pose2D as RelativePose>::identity();
        let result = p.compose(&identity);
        assert_relative_eq!(result.x, p.x);
        assert_relative_eq!(result.y, p.y);
        assert_relative_eq!(result.theta, p.theta);
    }

    #[test]
    fn test_pose_inverse_roundtrip() {
        let p = Pose2D::new(1.0, 2.0, 0.5);
        let inv = p.inverse();
        let result = p.compose(&inv);
        assert_relative_eq!(result.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.theta, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_point() {
        let pose = Pose2D::new(1.0, 0.0, FRAC_PI_2);
        let point = DVector::from_vec(vec![1.0, 0.0]);
        let result = pose.transform_point(&point);
        assert_relative_eq!(result[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(result[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_composition_order() {
        let move_forward = Pose2D::new(1.0, 0.0, 0.0);
        let rotate = Pose2D::new(0.0, 0.0, FRAC_PI_2);
        let result = move_forward.compose(&rotate);
        assert_relative_eq!(result.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(result.theta, FRAC_PI_2, epsilon = 1e-12);

        let result2 = rotate.compose(&move_forward);
        assert_relative_eq!(result2.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result2.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_retract_matches_increment_jacobian() {
        // Finite-difference check that retract() and increment_jacobian()
        // describe the same parameterization.
        let pose = Pose2D::new(0.4, -0.2, 0.3);
        let point = DVector::from_vec(vec![1.5, -0.7]);
        let eps = 1e-7;

        let jac = Pose2D::increment_jacobian(&point);
        let base = pose.transform_point(&point);
        let rot = pose.linear_part();

        for k in 0..3 {
            let mut delta = [0.0; 3];
            delta[k] = eps;
            let plus = pose.retract(&delta).transform_point(&point);
            // d(T∘exp(δ)·p)/dδ = R(T) · increment_jacobian(p)
            let expected = &rot * jac.column(k);
            assert_relative_eq!((plus[0] - base[0]) / eps, expected[0], epsilon = 1e-5);
            assert_relative_eq!((plus[1] - base[1]) / eps, expected[1], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_normalize_angle() {
        assert_relative_eq!(normalize_angle(0.0), 0.0);
        let wrapped = normalize_angle(3.0 * std::f64::consts::PI);
        assert!(wrapped.abs() > std::f64::consts::PI - 0.1);
    }
}
