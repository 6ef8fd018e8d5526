//! SE(3) rigid-body transforms with Lie-group exponential and logarithm.
//!
//! Poses are stored as a unit quaternion plus a translation vector. The
//! exp/log maps follow the usual convention with the rotation part stacked
//! after the translation part in the 6-vector: `xi = [rho, phi]`.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3, Vector6};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Constructs the skew-symmetric matrix `[v]x` such that `[v]x u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// A rigid-body transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation and a translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct a pure rotation from raw quaternion coefficients
    /// `(w, x, y, z)`; the quaternion is normalized.
    pub fn from_quaternion_coeffs(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self {
            rotation: UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
            translation: Vector3::zeros(),
        }
    }

    /// Compose two transforms: `self * other`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Inverse transform.
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation part as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Logarithm map: `xi = [rho, phi]` with `exp(xi) == self`.
    pub fn log(&self) -> Vector6<f64> {
        let phi = self.rotation.scaled_axis();
        let v_inv = left_jacobian_inv(&phi);
        let rho = v_inv * self.translation;
        Vector6::new(rho.x, rho.y, rho.z, phi.x, phi.y, phi.z)
    }

    /// Exponential map from a twist `xi = [rho, phi]`.
    pub fn exp(xi: &Vector6<f64>) -> SE3 {
        let rho = Vector3::new(xi[0], xi[1], xi[2]);
        let phi = Vector3::new(xi[3], xi[4], xi[5]);
        let rotation = UnitQuaternion::from_scaled_axis(phi);
        let v = left_jacobian(&phi);
        SE3 {
            rotation,
            translation: v * rho,
        }
    }

    /// Norm of the translation part.
    pub fn translation_norm(&self) -> f64 {
        self.translation.norm()
    }

    /// True if any stored coefficient is NaN or infinite.
    pub fn has_nan(&self) -> bool {
        !self.translation.iter().all(|x| x.is_finite())
            || !self.rotation.coords.iter().all(|x| x.is_finite())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Left Jacobian `V(phi)` of SE(3) relating the translation part of a twist
/// to the translation of the transform.
fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    if theta2 < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew(phi);
    }
    let theta = theta2.sqrt();
    let k = skew(phi);
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta2) * k
        + ((theta - theta.sin()) / (theta2 * theta)) * k * k
}

/// Inverse of the left Jacobian.
fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let k = skew(phi);
    if theta2 < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * k + (1.0 / 12.0) * k * k;
    }
    let theta = theta2.sqrt();
    let coeff = 1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * k + coeff * k * k
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.3, -0.2, 0.5)),
            Vector3::new(1.0, -2.0, 0.7),
        )
    }

    #[test]
    fn test_compose_inverse_is_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log_round_trip() {
        let t = sample_pose();
        let back = SE3::exp(&t.log());
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-9);
        assert_relative_eq!(
            (back.rotation.inverse() * t.rotation).angle(),
            0.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_log_of_identity_is_zero() {
        assert_relative_eq!(
            SE3::identity().log(),
            Vector6::zeros(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_half_motion_interpolation() {
        // exp(0.5 * log(T)) applied twice equals T.
        let t = sample_pose();
        let half = SE3::exp(&(t.log() * 0.5));
        let full = half.compose(&half);
        assert_relative_eq!(full.translation, t.translation, epsilon = 1e-9);
        assert_relative_eq!(
            (full.rotation.inverse() * t.rotation).angle(),
            0.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_transform_point_matches_compose() {
        let a = sample_pose();
        let b = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(-0.1, 0.2, 0.0)),
            Vector3::new(0.0, 1.0, -1.0),
        );
        let p = Vector3::new(0.4, 0.5, 2.0);
        let via_compose = a.compose(&b).transform_point(&p);
        let via_chain = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(via_compose, via_chain, epsilon = 1e-12);
    }

    #[test]
    fn test_pure_translation_log() {
        let t = SE3::new(UnitQuaternion::identity(), Vector3::new(3.0, 0.0, -1.0));
        let xi = t.log();
        assert_relative_eq!(xi[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(xi[2], -1.0, epsilon = 1e-12);
        assert_relative_eq!(xi.fixed_rows::<3>(3).norm(), 0.0, epsilon = 1e-12);
    }
}
