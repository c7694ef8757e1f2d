//! Vertices and factors of the optimization graph.
//!
//! Both are closed tagged variants: every problem this crate builds is made of
//! camera poses, points, planes, similarities, and ellipsoids tied together by
//! the factor kinds below. Reprojection factors carry the analytic g2o
//! Jacobians; the remaining factors are linearized by central differences
//! through each vertex's own `oplus`.

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3, Vector6};

use crate::geometry::{CameraIntrinsics, Ellipse, Ellipsoid, Plane3, Sim3, Sim3Tangent, SE3};

/// Vertex handle in the engine's single id space.
pub type VertexId = usize;

const NUMERIC_EPS: f64 = 1e-6;

/// Residual used when an ellipsoid cannot be projected (behind the camera or
/// degenerate), so the edge stays finite and clearly bad.
const DEGENERATE_OBJECT_RESIDUAL: f64 = 1e3;

#[derive(Debug, Clone, PartialEq)]
pub enum VertexEstimate {
    /// World-to-camera pose, updated on the left.
    Pose(SE3),
    /// World-frame point.
    Point(Vector3<f64>),
    /// World-frame plane.
    Plane(Plane3),
    /// World-to-camera similarity; `fix_scale` drops the scale from the update.
    Sim3 { value: Sim3, fix_scale: bool },
    /// World-frame ellipsoid.
    Ellipsoid(Ellipsoid),
}

impl VertexEstimate {
    /// Size of the minimal update.
    pub fn dimension(&self) -> usize {
        match self {
            VertexEstimate::Pose(_) => 6,
            VertexEstimate::Point(_) | VertexEstimate::Plane(_) => 3,
            VertexEstimate::Sim3 { fix_scale, .. } => {
                if *fix_scale {
                    6
                } else {
                    7
                }
            }
            VertexEstimate::Ellipsoid(_) => 9,
        }
    }

    /// Apply a minimal update of length [`dimension`](Self::dimension).
    pub fn oplus(&mut self, delta: &[f64]) {
        match self {
            VertexEstimate::Pose(pose) => {
                *pose = pose.retract_left(&Vector6::from_column_slice(&delta[..6]));
            }
            VertexEstimate::Point(p) => {
                *p += Vector3::new(delta[0], delta[1], delta[2]);
            }
            VertexEstimate::Plane(plane) => {
                plane.oplus(&Vector3::new(delta[0], delta[1], delta[2]));
            }
            VertexEstimate::Sim3 { value, fix_scale } => {
                let mut tangent = Sim3Tangent::zeros();
                tangent.fixed_rows_mut::<6>(0).copy_from_slice(&delta[..6]);
                if !*fix_scale {
                    tangent[6] = delta[6];
                }
                *value = value.retract_left(&tangent);
            }
            VertexEstimate::Ellipsoid(e) => e.oplus(&delta[..9]),
        }
    }

    pub fn as_pose(&self) -> Option<&SE3> {
        match self {
            VertexEstimate::Pose(pose) => Some(pose),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<&Vector3<f64>> {
        match self {
            VertexEstimate::Point(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_plane(&self) -> Option<&Plane3> {
        match self {
            VertexEstimate::Plane(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_sim3(&self) -> Option<&Sim3> {
        match self {
            VertexEstimate::Sim3 { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_ellipsoid(&self) -> Option<&Ellipsoid> {
        match self {
            VertexEstimate::Ellipsoid(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub id: VertexId,
    pub estimate: VertexEstimate,
    /// Held constant by the solver.
    pub fixed: bool,
    /// Eliminated first through the Schur complement.
    pub marginalized: bool,
}

impl Vertex {
    pub fn new(id: VertexId, estimate: VertexEstimate) -> Self {
        Self {
            id,
            estimate,
            fixed: false,
            marginalized: false,
        }
    }

    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn marginalized(mut self, marginalized: bool) -> Self {
        self.marginalized = marginalized;
        self
    }
}

/// Read access to current vertex estimates.
pub trait EstimateLookup {
    fn estimate(&self, id: VertexId) -> Option<&VertexEstimate>;
}

impl EstimateLookup for std::collections::HashMap<VertexId, Vertex> {
    fn estimate(&self, id: VertexId) -> Option<&VertexEstimate> {
        self.get(&id).map(|v| &v.estimate)
    }
}

/// A lookup with one vertex replaced, used for numeric differentiation.
struct Perturbed<'a, L: EstimateLookup + ?Sized> {
    base: &'a L,
    id: VertexId,
    value: VertexEstimate,
}

impl<L: EstimateLookup + ?Sized> EstimateLookup for Perturbed<'_, L> {
    fn estimate(&self, id: VertexId) -> Option<&VertexEstimate> {
        if id == self.id {
            Some(&self.value)
        } else {
            self.base.estimate(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    /// Monocular reprojection of a point into a keyframe/frame.
    MonoProjection {
        pose: VertexId,
        point: VertexId,
        measurement: Vector2<f64>,
        camera: CameraIntrinsics,
    },
    /// Rectified stereo reprojection `(u_left, v, u_right)`.
    StereoProjection {
        pose: VertexId,
        point: VertexId,
        measurement: Vector3<f64>,
        camera: CameraIntrinsics,
    },
    /// Full plane relation (normal angles and distance).
    Plane {
        pose: VertexId,
        plane: VertexId,
        measurement: Plane3,
    },
    /// Observed plane parallel to the landmark plane.
    ParallelPlane {
        pose: VertexId,
        plane: VertexId,
        measurement: Plane3,
    },
    /// Observed plane perpendicular to the landmark plane.
    VerticalPlane {
        pose: VertexId,
        plane: VertexId,
        measurement: Plane3,
    },
    /// Detection of a constant ellipsoid; constrains the pose only.
    ObjectDetection {
        pose: VertexId,
        ellipsoid: Ellipsoid,
        detection: Ellipse,
        camera: CameraIntrinsics,
    },
    /// Detection of an optimized ellipsoid.
    ObjectShape {
        pose: VertexId,
        ellipsoid: VertexId,
        detection: Ellipse,
        camera: CameraIntrinsics,
    },
    /// Relative similarity `S_ji` between two pose vertices `i` and `j`.
    Sim3Relative {
        from: VertexId,
        to: VertexId,
        measurement: Sim3,
    },
    /// Point of camera 2 mapped by `S12` and projected into camera 1.
    Sim3Projection {
        sim3: VertexId,
        point: VertexId,
        measurement: Vector2<f64>,
        camera: CameraIntrinsics,
    },
    /// Point of camera 1 mapped by `S12^-1` and projected into camera 2.
    Sim3InverseProjection {
        sim3: VertexId,
        point: VertexId,
        measurement: Vector2<f64>,
        camera: CameraIntrinsics,
    },
}

impl Factor {
    /// Connected vertices, in the order Jacobians are reported.
    pub fn vertices(&self) -> Vec<VertexId> {
        match self {
            Factor::MonoProjection { pose, point, .. }
            | Factor::StereoProjection { pose, point, .. } => vec![*pose, *point],
            Factor::Plane { pose, plane, .. }
            | Factor::ParallelPlane { pose, plane, .. }
            | Factor::VerticalPlane { pose, plane, .. } => vec![*pose, *plane],
            Factor::ObjectDetection { pose, .. } => vec![*pose],
            Factor::ObjectShape {
                pose, ellipsoid, ..
            } => vec![*pose, *ellipsoid],
            Factor::Sim3Relative { from, to, .. } => vec![*from, *to],
            Factor::Sim3Projection { sim3, point, .. }
            | Factor::Sim3InverseProjection { sim3, point, .. } => vec![*sim3, *point],
        }
    }

    /// Residual dimension.
    pub fn dimension(&self) -> usize {
        match self {
            Factor::MonoProjection { .. }
            | Factor::ParallelPlane { .. }
            | Factor::VerticalPlane { .. }
            | Factor::Sim3Projection { .. }
            | Factor::Sim3InverseProjection { .. } => 2,
            Factor::StereoProjection { .. } | Factor::Plane { .. } => 3,
            Factor::ObjectDetection { .. } | Factor::ObjectShape { .. } => 1,
            Factor::Sim3Relative { .. } => 7,
        }
    }

    /// Residual at the current estimates; `None` if a vertex is missing or
    /// has the wrong kind.
    pub fn error<L: EstimateLookup + ?Sized>(&self, lookup: &L) -> Option<DVector<f64>> {
        let e = match self {
            Factor::MonoProjection {
                pose,
                point,
                measurement,
                camera,
            } => {
                let pc = camera_point(lookup, *pose, *point)?;
                let r = measurement - camera.project(&pc);
                DVector::from_column_slice(r.as_slice())
            }
            Factor::StereoProjection {
                pose,
                point,
                measurement,
                camera,
            } => {
                let pc = camera_point(lookup, *pose, *point)?;
                let r = measurement - camera.project_stereo(&pc);
                DVector::from_column_slice(r.as_slice())
            }
            Factor::Plane {
                pose,
                plane,
                measurement,
            } => {
                let local = local_plane(lookup, *pose, *plane)?;
                DVector::from_column_slice(local.ominus(measurement).as_slice())
            }
            Factor::ParallelPlane {
                pose,
                plane,
                measurement,
            } => {
                let local = local_plane(lookup, *pose, *plane)?;
                DVector::from_column_slice(local.ominus_parallel(measurement).as_slice())
            }
            Factor::VerticalPlane {
                pose,
                plane,
                measurement,
            } => {
                let local = local_plane(lookup, *pose, *plane)?;
                DVector::from_column_slice(local.ominus_vertical(measurement).as_slice())
            }
            Factor::ObjectDetection {
                pose,
                ellipsoid,
                detection,
                camera,
            } => {
                let pose = lookup.estimate(*pose)?.as_pose()?;
                DVector::from_element(1, object_residual(ellipsoid, pose, detection, camera))
            }
            Factor::ObjectShape {
                pose,
                ellipsoid,
                detection,
                camera,
            } => {
                let pose = lookup.estimate(*pose)?.as_pose()?;
                let ellipsoid = lookup.estimate(*ellipsoid)?.as_ellipsoid()?;
                DVector::from_element(1, object_residual(ellipsoid, pose, detection, camera))
            }
            Factor::Sim3Relative {
                from,
                to,
                measurement,
            } => {
                let s_iw = lookup.estimate(*from)?.as_sim3()?;
                let s_jw = lookup.estimate(*to)?.as_sim3()?;
                let e = measurement.compose(s_iw).compose(&s_jw.inverse()).log();
                DVector::from_column_slice(e.as_slice())
            }
            Factor::Sim3Projection {
                sim3,
                point,
                measurement,
                camera,
            } => {
                let s12 = lookup.estimate(*sim3)?.as_sim3()?;
                let p2 = lookup.estimate(*point)?.as_point()?;
                let r = measurement - camera.project(&s12.transform_point(p2));
                DVector::from_column_slice(r.as_slice())
            }
            Factor::Sim3InverseProjection {
                sim3,
                point,
                measurement,
                camera,
            } => {
                let s12 = lookup.estimate(*sim3)?.as_sim3()?;
                let p1 = lookup.estimate(*point)?.as_point()?;
                let r = measurement - camera.project(&s12.inverse().transform_point(p1));
                DVector::from_column_slice(r.as_slice())
            }
        };
        Some(e)
    }

    /// Whether the observed point lies in front of the observing camera.
    /// `None` for factors that do not observe a point.
    pub fn is_depth_positive<L: EstimateLookup + ?Sized>(&self, lookup: &L) -> Option<bool> {
        match self {
            Factor::MonoProjection { pose, point, .. }
            | Factor::StereoProjection { pose, point, .. } => {
                Some(camera_point(lookup, *pose, *point)?.z > 0.0)
            }
            Factor::Sim3Projection { sim3, point, .. } => {
                let s12 = lookup.estimate(*sim3)?.as_sim3()?;
                let p2 = lookup.estimate(*point)?.as_point()?;
                Some(s12.transform_point(p2).z > 0.0)
            }
            Factor::Sim3InverseProjection { sim3, point, .. } => {
                let s12 = lookup.estimate(*sim3)?.as_sim3()?;
                let p1 = lookup.estimate(*point)?.as_point()?;
                Some(s12.inverse().transform_point(p1).z > 0.0)
            }
            _ => None,
        }
    }

    /// Jacobians of the residual with respect to each vertex in `wanted`
    /// (a subset of [`vertices`](Self::vertices)).
    pub fn jacobians<L: EstimateLookup + ?Sized>(
        &self,
        lookup: &L,
        wanted: &[VertexId],
    ) -> Option<Vec<(VertexId, DMatrix<f64>)>> {
        match self {
            Factor::MonoProjection {
                pose,
                point,
                camera,
                ..
            } => {
                let pose_cw = lookup.estimate(*pose)?.as_pose()?;
                let pw = lookup.estimate(*point)?.as_point()?;
                let (j_pose, j_point) = mono_jacobians(pose_cw, pw, camera);
                let mut out = Vec::with_capacity(2);
                if wanted.contains(pose) {
                    out.push((*pose, DMatrix::from_column_slice(2, 6, j_pose.as_slice())));
                }
                if wanted.contains(point) {
                    out.push((*point, DMatrix::from_column_slice(2, 3, j_point.as_slice())));
                }
                Some(out)
            }
            Factor::StereoProjection {
                pose,
                point,
                camera,
                ..
            } => {
                let pose_cw = lookup.estimate(*pose)?.as_pose()?;
                let pw = lookup.estimate(*point)?.as_point()?;
                let (j_pose, j_point) = stereo_jacobians(pose_cw, pw, camera);
                let mut out = Vec::with_capacity(2);
                if wanted.contains(pose) {
                    out.push((*pose, j_pose));
                }
                if wanted.contains(point) {
                    out.push((*point, j_point));
                }
                Some(out)
            }
            _ => self.numeric_jacobians(lookup, wanted),
        }
    }

    fn numeric_jacobians<L: EstimateLookup + ?Sized>(
        &self,
        lookup: &L,
        wanted: &[VertexId],
    ) -> Option<Vec<(VertexId, DMatrix<f64>)>> {
        let rows = self.dimension();
        let mut out = Vec::new();
        for id in self.vertices() {
            if !wanted.contains(&id) {
                continue;
            }
            let base = lookup.estimate(id)?.clone();
            let dim = base.dimension();
            let mut jac = DMatrix::zeros(rows, dim);
            let mut delta = vec![0.0; dim];
            for k in 0..dim {
                delta[k] = NUMERIC_EPS;
                let mut plus = base.clone();
                plus.oplus(&delta);
                delta[k] = -NUMERIC_EPS;
                let mut minus = base.clone();
                minus.oplus(&delta);
                delta[k] = 0.0;

                let e_plus = self.error(&Perturbed {
                    base: lookup,
                    id,
                    value: plus,
                })?;
                let e_minus = self.error(&Perturbed {
                    base: lookup,
                    id,
                    value: minus,
                })?;
                jac.set_column(k, &((e_plus - e_minus) / (2.0 * NUMERIC_EPS)));
            }
            out.push((id, jac));
        }
        Some(out)
    }
}

fn camera_point<L: EstimateLookup + ?Sized>(
    lookup: &L,
    pose: VertexId,
    point: VertexId,
) -> Option<Vector3<f64>> {
    let pose_cw = lookup.estimate(pose)?.as_pose()?;
    let pw = lookup.estimate(point)?.as_point()?;
    Some(pose_cw.transform_point(pw))
}

fn local_plane<L: EstimateLookup + ?Sized>(
    lookup: &L,
    pose: VertexId,
    plane: VertexId,
) -> Option<Plane3> {
    let pose_cw = lookup.estimate(pose)?.as_pose()?;
    let world = lookup.estimate(plane)?.as_plane()?;
    Some(world.transform(pose_cw))
}

fn object_residual(
    ellipsoid: &Ellipsoid,
    pose_cw: &SE3,
    detection: &Ellipse,
    camera: &CameraIntrinsics,
) -> f64 {
    ellipsoid
        .project(camera, pose_cw)
        .map(|projected| projected.wasserstein_distance(detection))
        .filter(|d| d.is_finite())
        .unwrap_or(DEGENERATE_OBJECT_RESIDUAL)
}

/// Jacobians of `obs - proj(T_cw * P)` for a left-updated pose
/// (`[rot, trans]` columns) and a world point.
pub fn mono_jacobians(
    pose_cw: &SE3,
    point_world: &Vector3<f64>,
    camera: &CameraIntrinsics,
) -> (Matrix2x6<f64>, Matrix2x3<f64>) {
    let p_cam = pose_cw.transform_point(point_world);
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    if z.abs() < 1e-6 {
        return (Matrix2x6::zeros(), Matrix2x3::zeros());
    }
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (camera.fx, camera.fy);

    let j_pose = Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    );

    let tmp = Matrix2x3::new(fx, 0.0, -fx * x * invz, 0.0, fy, -fy * y * invz);
    let j_point = (-invz) * tmp * pose_cw.rotation_matrix();

    (j_pose, j_point)
}

/// Stereo variant: the third row is the right-image abscissa.
pub fn stereo_jacobians(
    pose_cw: &SE3,
    point_world: &Vector3<f64>,
    camera: &CameraIntrinsics,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let (mono_pose, mono_point) = mono_jacobians(pose_cw, point_world, camera);
    let p_cam = pose_cw.transform_point(point_world);
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);

    let mut j_pose = DMatrix::zeros(3, 6);
    let mut j_point = DMatrix::zeros(3, 3);
    j_pose.view_mut((0, 0), (2, 6)).copy_from(&mono_pose);
    j_point.view_mut((0, 0), (2, 3)).copy_from(&mono_point);
    if z.abs() < 1e-6 {
        return (j_pose, j_point);
    }

    let bf = camera.bf;
    let invz2 = 1.0 / (z * z);
    j_pose[(2, 0)] = mono_pose[(0, 0)] - bf * y * invz2;
    j_pose[(2, 1)] = mono_pose[(0, 1)] + bf * x * invz2;
    j_pose[(2, 2)] = mono_pose[(0, 2)];
    j_pose[(2, 3)] = mono_pose[(0, 3)];
    j_pose[(2, 4)] = 0.0;
    j_pose[(2, 5)] = mono_pose[(0, 5)] - bf * invz2;

    let r: Matrix3<f64> = pose_cw.rotation_matrix();
    let d_ur = Vector3::new(camera.fx / z, 0.0, -camera.fx * x * invz2 + bf * invz2);
    let row = -(d_ur.transpose() * r);
    for c in 0..3 {
        j_point[(2, c)] = row[c];
    }

    (j_pose, j_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use std::collections::HashMap;

    fn graph(vertices: Vec<Vertex>) -> HashMap<VertexId, Vertex> {
        vertices.into_iter().map(|v| (v.id, v)).collect()
    }

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.05, -0.1, 0.2),
            Vector3::new(0.1, -0.2, 0.3),
        )
    }

    #[test]
    fn test_analytic_stereo_jacobians_match_numeric() {
        let camera = CameraIntrinsics::new(450.0, 460.0, 320.0, 240.0).with_stereo_baseline(40.0);
        let vertices = graph(vec![
            Vertex::new(0, VertexEstimate::Pose(sample_pose())),
            Vertex::new(1, VertexEstimate::Point(Vector3::new(0.4, -0.3, 4.0))),
        ]);
        let factor = Factor::StereoProjection {
            pose: 0,
            point: 1,
            measurement: Vector3::new(300.0, 200.0, 290.0),
            camera,
        };
        let analytic = factor.jacobians(&vertices, &[0, 1]).unwrap();
        let numeric = factor.numeric_jacobians(&vertices, &[0, 1]).unwrap();
        for ((_, a), (_, n)) in analytic.iter().zip(&numeric) {
            assert_relative_eq!(a, n, epsilon = 1e-4, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_mono_error_zero_at_exact_projection() {
        let camera = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let pose = sample_pose();
        let pw = Vector3::new(1.0, 0.5, 6.0);
        let vertices = graph(vec![
            Vertex::new(0, VertexEstimate::Pose(pose)),
            Vertex::new(1, VertexEstimate::Point(pw)),
        ]);
        let factor = Factor::MonoProjection {
            pose: 0,
            point: 1,
            measurement: camera.project(&pose.transform_point(&pw)),
            camera,
        };
        assert_relative_eq!(factor.error(&vertices).unwrap().norm(), 0.0, epsilon = 1e-9);
        assert_eq!(factor.is_depth_positive(&vertices), Some(true));
    }

    #[test]
    fn test_missing_or_mismatched_vertex_yields_none() {
        let vertices = graph(vec![Vertex::new(0, VertexEstimate::Point(Vector3::zeros()))]);
        let factor = Factor::Plane {
            pose: 0,
            plane: 1,
            measurement: Plane3::new(Vector3::z(), -1.0),
        };
        assert!(factor.error(&vertices).is_none());
    }

    #[test]
    fn test_plane_error_zero_when_consistent() {
        let pose = sample_pose();
        let world = Plane3::new(Vector3::new(0.0, 0.3, 1.0), -2.0);
        let vertices = graph(vec![
            Vertex::new(0, VertexEstimate::Pose(pose)),
            Vertex::new(1, VertexEstimate::Plane(world)),
        ]);
        let factor = Factor::Plane {
            pose: 0,
            plane: 1,
            measurement: world.transform(&pose),
        };
        assert_relative_eq!(factor.error(&vertices).unwrap().norm(), 0.0, epsilon = 1e-9);
        let jac = factor.jacobians(&vertices, &[1]).unwrap();
        assert_eq!(jac.len(), 1);
        assert_eq!(jac[0].1.shape(), (3, 3));
    }

    #[test]
    fn test_sim3_relative_error_zero_when_consistent() {
        let s_iw = Sim3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.0, 0.2),
            Vector3::new(1.0, 0.0, 0.0),
            1.0,
        );
        let s_jw = Sim3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0),
            Vector3::new(0.0, 2.0, 0.0),
            1.2,
        );
        let vertices = graph(vec![
            Vertex::new(0, VertexEstimate::Sim3 { value: s_iw, fix_scale: false }),
            Vertex::new(1, VertexEstimate::Sim3 { value: s_jw, fix_scale: false }),
        ]);
        let factor = Factor::Sim3Relative {
            from: 0,
            to: 1,
            measurement: s_jw.compose(&s_iw.inverse()),
        };
        assert_relative_eq!(factor.error(&vertices).unwrap().norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_scale_sim3_has_six_dof() {
        let mut est = VertexEstimate::Sim3 {
            value: Sim3::identity(),
            fix_scale: true,
        };
        assert_eq!(est.dimension(), 6);
        est.oplus(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let s = est.as_sim3().unwrap();
        assert_relative_eq!(s.scale, 1.0);
        assert_relative_eq!(s.translation, Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_object_detection_residual_small_for_matching_box() {
        let camera = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let ellipsoid = Ellipsoid::new(
            Vector3::new(0.0, 0.0, 5.0),
            UnitQuaternion::identity(),
            Vector3::repeat(0.5),
        );
        let detection = ellipsoid.project(&camera, &SE3::identity()).unwrap();
        let vertices = graph(vec![Vertex::new(0, VertexEstimate::Pose(SE3::identity()))]);
        let factor = Factor::ObjectDetection {
            pose: 0,
            ellipsoid,
            detection,
            camera,
        };
        assert_relative_eq!(factor.error(&vertices).unwrap()[0], 0.0, epsilon = 1e-3);
    }
}
