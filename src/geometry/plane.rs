//! Infinite planes in Hessian normal form, with the minimal 3-DoF
//! parametrization used by the plane factors.
//!
//! A plane is stored as coefficients `(n, d)` with `|n| = 1` and
//! `n · x + d = 0` for every point `x` on it. Residuals are expressed as the
//! azimuth/elevation of one normal seen from a frame whose x-axis is the
//! other normal, plus (for the full relation) the difference in distance.

use nalgebra::{Matrix3, Rotation3, Unit, UnitQuaternion, Vector2, Vector3, Vector4};

use super::SE3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane3 {
    coeffs: Vector4<f64>,
}

impl Plane3 {
    /// Build from raw `(a, b, c, d)`; the normal is rescaled to unit length.
    pub fn from_coefficients(coeffs: Vector4<f64>) -> Self {
        let mut plane = Self { coeffs };
        plane.normalize();
        plane
    }

    pub fn new(normal: Vector3<f64>, d: f64) -> Self {
        Self::from_coefficients(Vector4::new(normal.x, normal.y, normal.z, d))
    }

    pub fn coefficients(&self) -> Vector4<f64> {
        self.coeffs
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.coeffs.xyz()
    }

    /// Signed distance of the origin along the normal (`-d`).
    pub fn distance(&self) -> f64 {
        -self.coeffs[3]
    }

    /// Signed distance of `p` to the plane.
    pub fn signed_distance(&self, p: &Vector3<f64>) -> f64 {
        self.normal().dot(p) + self.coeffs[3]
    }

    fn normalize(&mut self) {
        let n = self.coeffs.xyz().norm();
        if n > f64::EPSILON {
            self.coeffs /= n;
        }
    }

    pub fn azimuth(v: &Vector3<f64>) -> f64 {
        v.y.atan2(v.x)
    }

    pub fn elevation(v: &Vector3<f64>) -> f64 {
        v.z.atan2(v.xy().norm())
    }

    /// Rotation that maps the x-axis onto the direction of `v`.
    pub fn rotation(v: &Vector3<f64>) -> Matrix3<f64> {
        let az = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), Self::azimuth(v));
        let el = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -Self::elevation(v));
        (az * el).to_rotation_matrix().into_inner()
    }

    /// Plane expressed in the frame reached by `pose` (world-to-camera when
    /// `self` is a world plane).
    pub fn transform(&self, pose: &SE3) -> Self {
        let n = pose.rotation * self.normal();
        let d = self.coeffs[3] - pose.translation.dot(&n);
        Self::new(n, d)
    }

    /// Apply a minimal update `[d_azimuth, d_elevation, d_distance]`.
    pub fn oplus(&mut self, delta: &Vector3<f64>) {
        let (s, c) = delta[1].sin_cos();
        let n = Vector3::new(c * delta[0].cos(), c * delta[0].sin(), s);
        let rotated = Self::rotation(&self.normal()) * n;
        let d = self.distance() + delta[2];
        self.coeffs = Vector4::new(rotated.x, rotated.y, rotated.z, -d);
        self.normalize();
    }

    /// Full 3-D discrepancy `[azimuth, elevation, distance]` of `other` as
    /// seen from `self`.
    pub fn ominus(&self, other: &Plane3) -> Vector3<f64> {
        let r = Self::rotation(&self.normal()).transpose();
        let n = r * other.normal();
        Vector3::new(
            Self::azimuth(&n),
            Self::elevation(&n),
            self.distance() - other.distance(),
        )
    }

    /// Angular discrepancy for a parallel relation; opposite normals count as
    /// parallel.
    pub fn ominus_parallel(&self, other: &Plane3) -> Vector2<f64> {
        let mut normal = self.normal();
        if other.normal().dot(&normal) < 0.0 {
            normal = -normal;
        }
        let r = Self::rotation(&normal).transpose();
        let n = r * other.normal();
        Vector2::new(Self::azimuth(&n), Self::elevation(&n))
    }

    /// Angular discrepancy for a perpendicular relation: `self`'s normal is
    /// turned a quarter turn towards `other` before comparing.
    pub fn ominus_vertical(&self, other: &Plane3) -> Vector2<f64> {
        let normal = self.normal();
        let axis = normal.cross(&other.normal());
        let axis = if axis.norm() > 1e-12 {
            Unit::new_normalize(axis)
        } else {
            // Coincident normals: any perpendicular axis gives the same residual magnitude.
            Unit::new_normalize(normal.cross(&Self::least_aligned_axis(&normal)))
        };
        let quarter = Rotation3::from_axis_angle(&axis, std::f64::consts::FRAC_PI_2);
        let b = quarter * normal;
        let r = Self::rotation(&b).transpose();
        let n = r * other.normal();
        Vector2::new(Self::azimuth(&n), Self::elevation(&n))
    }

    fn least_aligned_axis(v: &Vector3<f64>) -> Vector3<f64> {
        let a = v.abs();
        if a.x <= a.y && a.x <= a.z {
            Vector3::x()
        } else if a.y <= a.z {
            Vector3::y()
        } else {
            Vector3::z()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ominus_self_is_zero() {
        let p = Plane3::new(Vector3::new(0.3, -0.5, 0.8), -2.0);
        assert_relative_eq!(p.ominus(&p), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_maps_x_axis_to_normal() {
        let v = Vector3::new(0.2, 0.6, -0.7).normalize();
        let r = Plane3::rotation(&v);
        assert_relative_eq!(r * Vector3::x(), v, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_keeps_points_on_plane() {
        let plane = Plane3::new(Vector3::new(0.0, 0.0, 1.0), -1.5);
        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.3, -0.1, 0.7),
            Vector3::new(0.2, 1.0, -0.5),
        );
        let local = plane.transform(&pose);
        for pw in [
            Vector3::new(0.0, 0.0, 1.5),
            Vector3::new(3.0, -2.0, 1.5),
            Vector3::new(-1.0, 4.0, 1.5),
        ] {
            let pc = pose.transform_point(&pw);
            assert_relative_eq!(local.signed_distance(&pc), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_oplus_zero_is_noop_and_distance_update() {
        let mut p = Plane3::new(Vector3::new(1.0, 1.0, 0.0), -3.0);
        let before = p;
        p.oplus(&Vector3::zeros());
        assert_relative_eq!(p.coefficients(), before.coefficients(), epsilon = 1e-12);

        p.oplus(&Vector3::new(0.0, 0.0, 0.25));
        assert_relative_eq!(p.distance(), before.distance() + 0.25, epsilon = 1e-12);
        assert_relative_eq!(p.normal(), before.normal(), epsilon = 1e-12);
    }

    #[test]
    fn test_oplus_then_ominus_recovers_angles() {
        let base = Plane3::new(Vector3::new(0.1, 0.9, 0.3), 0.7);
        let mut moved = base;
        moved.oplus(&Vector3::new(0.05, -0.03, 0.0));
        let e = base.ominus(&moved);
        assert_relative_eq!(e[0], 0.05, epsilon = 1e-9);
        assert_relative_eq!(e[1], -0.03, epsilon = 1e-9);
    }

    #[test]
    fn test_parallel_accepts_opposite_normals() {
        let a = Plane3::new(Vector3::new(0.0, 1.0, 0.0), -1.0);
        let b = Plane3::new(Vector3::new(0.0, -1.0, 0.0), 4.0);
        assert_relative_eq!(a.ominus_parallel(&b), Vector2::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_vertical_zero_for_perpendicular_normals() {
        let wall = Plane3::new(Vector3::new(1.0, 0.0, 0.0), -2.0);
        let floor = Plane3::new(Vector3::new(0.0, 1.0, 0.0), 1.0);
        assert_relative_eq!(wall.ominus_vertical(&floor), Vector2::zeros(), epsilon = 1e-12);

        let tilted = Plane3::new(Vector3::new(0.2, 1.0, 0.0), 1.0);
        assert!(wall.ominus_vertical(&tilted).norm() > 0.1);
    }
}
