//! Object landmarks as ellipsoids and their image-plane projections.
//!
//! An ellipsoid projects through `P = K [R | t]` to an ellipse via its dual
//! quadric: `C* = P Q* P^T`. Detections are axis-aligned boxes, compared to the
//! projection through their inscribed ellipse.

use nalgebra::{Matrix2, Matrix3, Matrix3x4, Matrix4, UnitQuaternion, Vector2, Vector3};

use super::{CameraIntrinsics, SE3};

/// Axis-aligned detection box in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(
            0.5 * (self.x_min + self.x_max),
            0.5 * (self.y_min + self.y_max),
        )
    }

    /// Ellipse inscribed in the box.
    pub fn inscribed_ellipse(&self) -> Ellipse {
        Ellipse::new(
            self.center(),
            Vector2::new(
                0.5 * (self.x_max - self.x_min),
                0.5 * (self.y_max - self.y_min),
            ),
            0.0,
        )
    }
}

/// Image ellipse: center, semi-axes, and orientation of the first axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: Vector2<f64>,
    pub axes: Vector2<f64>,
    pub angle: f64,
}

impl Ellipse {
    pub fn new(center: Vector2<f64>, axes: Vector2<f64>, angle: f64) -> Self {
        Self {
            center,
            axes,
            angle,
        }
    }

    /// Shape matrix `R diag(a^2, b^2) R^T`.
    pub fn shape_matrix(&self) -> Matrix2<f64> {
        let (s, c) = self.angle.sin_cos();
        let r = Matrix2::new(c, -s, s, c);
        r * Matrix2::new(self.axes.x.powi(2), 0.0, 0.0, self.axes.y.powi(2)) * r.transpose()
    }

    /// Recover an ellipse from a dual conic. `None` for degenerate conics
    /// (e.g. the quadric is behind the camera).
    pub fn from_dual_conic(dual: &Matrix3<f64>) -> Option<Self> {
        let w = dual[(2, 2)];
        if w.abs() < 1e-12 {
            return None;
        }
        let c = dual / (-w);
        let center = Vector2::new(-c[(0, 2)], -c[(1, 2)]);
        let shape = c.fixed_view::<2, 2>(0, 0).into_owned() + center * center.transpose();
        let shape = 0.5 * (shape + shape.transpose());
        let eig = shape.symmetric_eigen();
        if eig.eigenvalues.iter().any(|&l| l <= 0.0 || !l.is_finite()) {
            return None;
        }
        let first = eig.eigenvectors.column(0);
        Some(Self {
            center,
            axes: Vector2::new(eig.eigenvalues[0].sqrt(), eig.eigenvalues[1].sqrt()),
            angle: first[1].atan2(first[0]),
        })
    }

    /// 2-Wasserstein distance between the Gaussians whose mean and covariance
    /// are the ellipses' centers and shape matrices.
    pub fn wasserstein_distance(&self, other: &Ellipse) -> f64 {
        let a = self.shape_matrix();
        let b = other.shape_matrix();
        let sqrt_a = sqrtm_spd(&a);
        let cross = sqrtm_spd(&(sqrt_a * b * sqrt_a));
        let trace_term = (a + b - 2.0 * cross).trace().max(0.0);
        ((self.center - other.center).norm_squared() + trace_term).sqrt()
    }
}

/// Principal square root of a 2x2 symmetric positive semi-definite matrix.
fn sqrtm_spd(m: &Matrix2<f64>) -> Matrix2<f64> {
    let det = m.determinant().max(0.0);
    let s = det.sqrt();
    let t = (m.trace() + 2.0 * s).max(0.0).sqrt();
    if t < 1e-12 {
        return Matrix2::zeros();
    }
    (m + Matrix2::identity() * s) / t
}

/// Object landmark: center, orientation, and semi-axes in world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub center: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub axes: Vector3<f64>,
}

impl Ellipsoid {
    pub fn new(center: Vector3<f64>, orientation: UnitQuaternion<f64>, axes: Vector3<f64>) -> Self {
        Self {
            center,
            orientation,
            axes,
        }
    }

    /// Dual quadric `Q* = T diag(a^2, b^2, c^2, -1) T^T` with `T = [R c; 0 1]`.
    pub fn dual_quadric(&self) -> Matrix4<f64> {
        let mut t = Matrix4::identity();
        t.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.orientation.to_rotation_matrix().into_inner());
        t.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.center);
        let d = Matrix4::from_diagonal(&nalgebra::Vector4::new(
            self.axes.x.powi(2),
            self.axes.y.powi(2),
            self.axes.z.powi(2),
            -1.0,
        ));
        t * d * t.transpose()
    }

    pub fn project_with(&self, projection: &Matrix3x4<f64>) -> Option<Ellipse> {
        let dual = projection * self.dual_quadric() * projection.transpose();
        Ellipse::from_dual_conic(&dual)
    }

    /// Project into a camera at world-to-camera pose `pose_cw`.
    pub fn project(&self, camera: &CameraIntrinsics, pose_cw: &SE3) -> Option<Ellipse> {
        if pose_cw.transform_point(&self.center).z <= 0.0 {
            return None;
        }
        self.project_with(&camera.projection_matrix(pose_cw))
    }

    /// 9-DoF update `[d_axes (3), d_rotation (3), d_center (3)]`.
    pub fn oplus(&mut self, delta: &[f64]) {
        for i in 0..3 {
            self.axes[i] = (self.axes[i] + delta[i]).max(1e-6);
        }
        let rot = UnitQuaternion::from_scaled_axis(Vector3::new(delta[3], delta[4], delta[5]));
        self.orientation *= rot;
        self.center += Vector3::new(delta[6], delta[7], delta[8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sphere_in_front_projects_to_circle() {
        let cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let sphere = Ellipsoid::new(
            Vector3::new(0.0, 0.0, 5.0),
            UnitQuaternion::identity(),
            Vector3::new(0.5, 0.5, 0.5),
        );
        let e = sphere.project(&cam, &SE3::identity()).unwrap();
        assert_relative_eq!(e.center, Vector2::new(320.0, 240.0), epsilon = 1e-6);
        assert_relative_eq!(e.axes.x, e.axes.y, epsilon = 1e-6);
        // Tangent cone half-angle: tan = r / sqrt(d^2 - r^2).
        let expected = 500.0 * 0.5 / (25.0f64 - 0.25).sqrt();
        assert_relative_eq!(e.axes.x, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_behind_camera_has_no_projection() {
        let cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let e = Ellipsoid::new(
            Vector3::new(0.0, 0.0, -5.0),
            UnitQuaternion::identity(),
            Vector3::new(0.5, 0.5, 0.5),
        );
        assert!(e.project(&cam, &SE3::identity()).is_none());
    }

    #[test]
    fn test_wasserstein_zero_for_identical_and_center_offset() {
        let a = BoundingBox::new(10.0, 20.0, 50.0, 80.0).inscribed_ellipse();
        assert_relative_eq!(a.wasserstein_distance(&a), 0.0, epsilon = 1e-4);

        let mut b = a;
        b.center += Vector2::new(3.0, 4.0);
        assert_relative_eq!(a.wasserstein_distance(&b), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dual_conic_roundtrip() {
        let e = Ellipse::new(Vector2::new(100.0, 50.0), Vector2::new(30.0, 10.0), 0.4);
        let m = e.shape_matrix();
        let mut dual = Matrix3::zeros();
        dual.fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&(m - e.center * e.center.transpose()));
        dual[(0, 2)] = -e.center.x;
        dual[(1, 2)] = -e.center.y;
        dual[(2, 0)] = -e.center.x;
        dual[(2, 1)] = -e.center.y;
        dual[(2, 2)] = -1.0;
        let r = Ellipse::from_dual_conic(&(dual * 3.0)).unwrap();
        assert_relative_eq!(r.center, e.center, epsilon = 1e-9);
        assert_relative_eq!(r.shape_matrix(), m, epsilon = 1e-6);
    }

    #[test]
    fn test_oplus_moves_center_and_axes() {
        let mut e = Ellipsoid::new(
            Vector3::zeros(),
            UnitQuaternion::identity(),
            Vector3::new(1.0, 2.0, 3.0),
        );
        e.oplus(&[0.1, 0.0, -0.5, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
        assert_relative_eq!(e.axes, Vector3::new(1.1, 2.0, 2.5), epsilon = 1e-12);
        assert_relative_eq!(e.center, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
    }
}
