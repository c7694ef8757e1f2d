//! SE3: rigid body transformation used for keyframe and frame poses.
//!
//! Poses are stored world-to-camera (`T_cw`). Optimization updates are applied
//! on the left: `T <- exp(delta) * T`, with `delta = [omega, v]` (rotation first).

use nalgebra::{Isometry3, Matrix3, Matrix4, Translation3, UnitQuaternion, Vector3, Vector6};

/// Rigid transform: `p' = R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from quaternion components (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation =
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self * other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Camera center in world coordinates when `self` is `T_cw`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.to_isometry().to_homogeneous()
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    /// Exponential of a tangent vector `[omega, v]`.
    ///
    /// Rotation and translation are decoupled; at `delta = 0` the derivative
    /// matches the true SE3 exponential, which is all the solver needs.
    pub fn exp(delta: &Vector6<f64>) -> Self {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let v = Vector3::new(delta[3], delta[4], delta[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: v,
        }
    }

    /// Inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        Vector6::new(
            omega.x,
            omega.y,
            omega.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    /// Left-multiplicative update `exp(delta) * self`.
    pub fn retract_left(&self, delta: &Vector6<f64>) -> Self {
        SE3::exp(delta).compose(self)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
