//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Used by the essential-graph optimization (keyframe poses as similarities so
//! that monocular scale drift can be corrected) and by two-view similarity
//! refinement. With `fix_scale` the scale component is held at its seed value.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::SE3;

/// Tangent vector layout: `[rotation_vec (3), translation (3), log_scale (1)]`.
pub type Sim3Tangent = nalgebra::SVector<f64, 7>;

/// 7-DOF similarity: `p' = s * R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Rigid pose lifted to a similarity with unit scale.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Rigid pose `[R | t / s]` recovered from a similarity `T_cw`.
    ///
    /// This is how corrected keyframe poses are read back after the
    /// essential-graph optimization.
    pub fn to_se3_unscaled(&self) -> SE3 {
        SE3::new(self.rotation, self.translation / self.scale)
    }

    /// For `S = [sR | t]`: `S^{-1} = [(1/s)R^T | -(1/s)R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// `self ∘ other = [s1 s2 R1 R2 | s1 R1 t2 + t1]`.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn log(&self) -> Sim3Tangent {
        let rot_vec = self.rotation.scaled_axis();
        Sim3Tangent::from_column_slice(&[
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ])
    }

    pub fn exp(tangent: &Sim3Tangent) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }

    /// Left-multiplicative update `exp(delta) ∘ self`.
    pub fn retract_left(&self, delta: &Sim3Tangent) -> Self {
        Self::exp(delta).compose(self)
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Sim3 {
        Sim3::new(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            Vector3::new(1.0, 2.0, 3.0),
            2.0,
        )
    }

    #[test]
    fn test_inverse_roundtrips_points() {
        let s = sample();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let back = s.inverse().transform_point(&s.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-10);

        let composed = s.compose(&s.inverse());
        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_compose_scales_multiply() {
        let s1 = Sim3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0), 2.0);
        let s2 = Sim3::new(UnitQuaternion::identity(), Vector3::new(0.0, 1.0, 0.0), 3.0);
        let c = s1.compose(&s2);
        assert_relative_eq!(c.scale, 6.0, epsilon = 1e-10);
        assert_relative_eq!(c.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-10);
    }

    #[test]
    fn test_transform_point_with_scale() {
        let s = Sim3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0), 2.0);
        let p = s.transform_point(&Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(p, Vector3::new(3.0, 2.0, 2.0), epsilon = 1e-10);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let s = Sim3::new(
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5),
            Vector3::new(1.0, 2.0, 3.0),
            1.5,
        );
        let r = Sim3::exp(&s.log());
        assert_relative_eq!(r.scale, s.scale, epsilon = 1e-10);
        assert_relative_eq!(r.translation, s.translation, epsilon = 1e-10);
        assert_relative_eq!(r.rotation.coords, s.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_unscaled_recovery_preserves_camera_center() {
        // A rigid pose expressed with scale s: camera center must be invariant.
        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.1, -0.3),
            Vector3::new(0.4, -0.2, 1.0),
        );
        let s = 1.7;
        let sim = Sim3::new(pose.rotation, pose.translation * s, s);
        let recovered = sim.to_se3_unscaled();
        assert_relative_eq!(recovered.translation, pose.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_retract_left_zero_is_noop() {
        let s = sample();
        let r = s.retract_left(&Sim3Tangent::zeros());
        assert_relative_eq!(r.translation, s.translation, epsilon = 1e-12);
        assert_relative_eq!(r.scale, s.scale, epsilon = 1e-12);
    }
}
