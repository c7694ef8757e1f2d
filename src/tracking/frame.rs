//! The tracked frame consumed by camera-only pose optimization.
//!
//! A Frame holds undistorted observations and the landmark/plane matches the
//! tracker found for them. Pose optimization refines `pose_cw` and fills in
//! the outlier flags; the tracker then drops flagged matches.

use crate::atlas::map::{KeyPoint, MapPlaneId, MapPointId, ScalePyramid};
use crate::geometry::{CameraIntrinsics, Plane3, SE3};

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub timestamp: f64,

    /// World-to-camera pose estimate (T_cw).
    pub pose_cw: SE3,

    pub camera: CameraIntrinsics,
    pub pyramid: ScalePyramid,

    pub keypoints: Vec<KeyPoint>,

    /// Right-image abscissa per keypoint; negative for monocular observations.
    pub u_right: Vec<f64>,

    pub map_point_ids: Vec<Option<MapPointId>>,
    pub outliers: Vec<bool>,

    /// Observed planes, camera frame.
    pub plane_coefficients: Vec<Plane3>,
    pub map_plane_ids: Vec<Option<MapPlaneId>>,
    pub plane_outliers: Vec<bool>,
    pub parallel_plane_ids: Vec<Option<MapPlaneId>>,
    pub parallel_plane_outliers: Vec<bool>,
    pub vertical_plane_ids: Vec<Option<MapPlaneId>>,
    pub vertical_plane_outliers: Vec<bool>,

    pub not_seen_plane_coefficients: Vec<Plane3>,
    pub not_seen_plane_ids: Vec<Option<MapPlaneId>>,
    pub not_seen_plane_outliers: Vec<bool>,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: f64,
        pose_cw: SE3,
        camera: CameraIntrinsics,
        keypoints: Vec<KeyPoint>,
        u_right: Vec<f64>,
    ) -> Self {
        let n = keypoints.len();
        let mut u_right = u_right;
        u_right.resize(n, -1.0);
        Self {
            id,
            timestamp,
            pose_cw,
            camera,
            pyramid: ScalePyramid::default(),
            keypoints,
            u_right,
            map_point_ids: vec![None; n],
            outliers: vec![false; n],
            plane_coefficients: Vec::new(),
            map_plane_ids: Vec::new(),
            plane_outliers: Vec::new(),
            parallel_plane_ids: Vec::new(),
            parallel_plane_outliers: Vec::new(),
            vertical_plane_ids: Vec::new(),
            vertical_plane_outliers: Vec::new(),
            not_seen_plane_coefficients: Vec::new(),
            not_seen_plane_ids: Vec::new(),
            not_seen_plane_outliers: Vec::new(),
        }
    }

    /// Register observed planes; every relation slot starts unmatched.
    pub fn set_plane_observations(&mut self, planes: Vec<Plane3>) {
        let n = planes.len();
        self.plane_coefficients = planes;
        self.map_plane_ids = vec![None; n];
        self.plane_outliers = vec![false; n];
        self.parallel_plane_ids = vec![None; n];
        self.parallel_plane_outliers = vec![false; n];
        self.vertical_plane_ids = vec![None; n];
        self.vertical_plane_outliers = vec![false; n];
    }

    pub fn set_not_seen_plane_observations(&mut self, planes: Vec<Plane3>) {
        let n = planes.len();
        self.not_seen_plane_coefficients = planes;
        self.not_seen_plane_ids = vec![None; n];
        self.not_seen_plane_outliers = vec![false; n];
    }

    pub fn is_stereo_observation(&self, idx: usize) -> bool {
        self.u_right.get(idx).is_some_and(|&u| u >= 0.0)
    }

    pub fn num_tracked_points(&self) -> usize {
        self.map_point_ids
            .iter()
            .zip(&self.outliers)
            .filter(|(mp, outlier)| mp.is_some() && !**outlier)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_new_frame_slots() {
        let kps = vec![KeyPoint::new(1.0, 2.0, 0), KeyPoint::new(3.0, 4.0, 1)];
        let mut frame = Frame::new(
            7,
            0.5,
            SE3::identity(),
            CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0),
            kps,
            vec![0.5],
        );
        assert!(frame.is_stereo_observation(0));
        assert!(!frame.is_stereo_observation(1));
        assert_eq!(frame.num_tracked_points(), 0);

        frame.map_point_ids[1] = Some(MapPointId::new(3));
        assert_eq!(frame.num_tracked_points(), 1);
        frame.outliers[1] = true;
        assert_eq!(frame.num_tracked_points(), 0);

        frame.set_plane_observations(vec![Plane3::new(Vector3::z(), -2.0)]);
        assert_eq!(frame.vertical_plane_outliers, vec![false]);
    }
}
