//! Pinhole intrinsics with an optional stereo baseline.

use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};

use super::SE3;

/// Calibration of an undistorted pinhole camera.
///
/// `bf` is baseline times focal length, used to predict the right-image
/// abscissa of a rectified stereo pair. It is zero for monocular cameras.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub bf: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            bf: 0.0,
        }
    }

    pub fn with_stereo_baseline(mut self, bf: f64) -> Self {
        self.bf = bf;
        self
    }

    /// Project a camera-frame point to pixel coordinates.
    pub fn project(&self, pc: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / pc.z;
        Vector2::new(
            self.fx * pc.x * inv_z + self.cx,
            self.fy * pc.y * inv_z + self.cy,
        )
    }

    /// Project to `(u_left, v, u_right)`.
    pub fn project_stereo(&self, pc: &Vector3<f64>) -> Vector3<f64> {
        let uv = self.project(pc);
        Vector3::new(uv.x, uv.y, uv.x - self.bf / pc.z)
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Projection matrix `K [R | t]` for a world-to-camera pose.
    pub fn projection_matrix(&self, pose_cw: &SE3) -> Matrix3x4<f64> {
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&pose_cw.rotation_matrix());
        rt.fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&pose_cw.translation);
        self.k_matrix() * rt
    }
}
