//! Synthetic maps shared by the adjuster tests.
//!
//! Keyframes sit on a line along x, one unit apart, looking down +z. Points
//! come in groups of `points_per_group` around each keyframe, and keyframe `i`
//! observes groups `i-1..=i+1`, so covisibility only reaches one neighbour on
//! each side. Every keyframe sees a ground plane and a back wall; a side plane
//! is attached through the not-seen relation.

use nalgebra::{UnitQuaternion, Vector3, Vector6};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::atlas::map::{
    KeyFrame, KeyFrameId, KeyPoint, Map, MapObject, MapObjectId, MapPlane, MapPlaneId, MapPoint,
    MapPointId, ObjectTrack, ObjectTrackId, PlaneRelation,
};
use crate::geometry::{BoundingBox, CameraIntrinsics, Ellipsoid, Plane3, SE3};

pub struct SceneConfig {
    pub keyframes: usize,
    pub points_per_group: usize,
    pub stereo: bool,
    pub planes: bool,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            keyframes: 5,
            points_per_group: 12,
            stereo: true,
            planes: true,
            seed: 3,
        }
    }
}

pub struct Scene {
    pub map: Map,
    pub true_poses: Vec<SE3>,
    pub true_points: Vec<Vector3<f64>>,
}

pub fn camera() -> CameraIntrinsics {
    CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0).with_stereo_baseline(40.0)
}

pub fn true_pose(i: usize) -> SE3 {
    let yaw = 0.02 * i as f64;
    let rotation = UnitQuaternion::from_euler_angles(0.0, yaw, 0.0);
    let center = Vector3::new(i as f64, 0.0, 0.0);
    SE3::new(rotation, -(rotation * center))
}

pub fn world_planes() -> Vec<Plane3> {
    vec![
        // Ground, y = 2.
        Plane3::new(Vector3::new(0.0, 1.0, 0.0), -2.0),
        // Back wall, z = 9.
        Plane3::new(Vector3::new(0.0, 0.0, 1.0), -9.0),
        // Side wall, x = -3.
        Plane3::new(Vector3::new(1.0, 0.0, 0.0), 3.0),
    ]
}

impl Scene {
    pub fn new(config: SceneConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let camera = camera();
        let n = config.keyframes;

        let true_poses: Vec<SE3> = (0..n).map(true_pose).collect();
        let mut true_points = Vec::new();
        for g in 0..n {
            for _ in 0..config.points_per_group {
                true_points.push(Vector3::new(
                    g as f64 + rng.gen_range(-0.5..0.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..6.0),
                ));
            }
        }
        let group_of = |j: usize| j / config.points_per_group;

        let mut map = Map::new();
        for (i, pose) in true_poses.iter().enumerate() {
            let observed: Vec<usize> = (0..true_points.len())
                .filter(|&j| group_of(j).abs_diff(i) <= 1)
                .collect();
            let mut keypoints = Vec::with_capacity(observed.len());
            let mut u_right = Vec::with_capacity(observed.len());
            for &j in &observed {
                let pc = pose.transform_point(&true_points[j]);
                let uvr = camera.project_stereo(&pc);
                keypoints.push(KeyPoint::new(uvr.x, uvr.y, 0));
                u_right.push(if config.stereo { uvr.z } else { -1.0 });
            }
            let mut kf = KeyFrame::new(
                KeyFrameId::new(i as u64),
                i as f64 * 0.1,
                *pose,
                camera,
                keypoints,
                u_right,
            );
            if config.planes {
                let planes = world_planes();
                kf.set_plane_observations(vec![
                    planes[0].transform(pose),
                    planes[1].transform(pose),
                ]);
                kf.set_not_seen_plane_observations(vec![planes[2].transform(pose)]);
            }
            map.add_keyframe(kf);
            if i > 0 {
                map.set_spanning_parent(KeyFrameId::new(i as u64), KeyFrameId::new(i as u64 - 1));
            }
        }

        for (j, p) in true_points.iter().enumerate() {
            let reference = KeyFrameId::new(group_of(j) as u64);
            map.add_map_point(MapPoint::new(MapPointId::new(j as u64), *p, reference));
        }
        for i in 0..n {
            let observed: Vec<usize> = (0..true_points.len())
                .filter(|&j| group_of(j).abs_diff(i) <= 1)
                .collect();
            for (feature_idx, &j) in observed.iter().enumerate() {
                map.associate(KeyFrameId::new(i as u64), feature_idx, MapPointId::new(j as u64));
            }
        }
        for j in 0..true_points.len() {
            map.update_map_point_normal_and_depth(MapPointId::new(j as u64));
        }

        if config.planes {
            let true_planes = world_planes();
            map.add_map_plane(MapPlane::new(MapPlaneId::new(0), true_planes[0], true));
            map.add_map_plane(MapPlane::new(MapPlaneId::new(1), true_planes[1], true));
            map.add_map_plane(MapPlane::new(MapPlaneId::new(2), true_planes[2], false));
            for i in 0..n as u64 {
                let kf = KeyFrameId::new(i);
                map.associate_plane(PlaneRelation::Seen, kf, 0, MapPlaneId::new(0));
                map.associate_plane(PlaneRelation::Seen, kf, 1, MapPlaneId::new(1));
                map.associate_plane(PlaneRelation::NotSeen, kf, 0, MapPlaneId::new(2));
            }
        }

        Self {
            map,
            true_poses,
            true_points,
        }
    }

    /// Nudge every non-origin pose and every point by a deterministic amount.
    pub fn perturb(&mut self, seed: u64, pose_noise: f64, point_noise: f64) {
        self.perturb_from(1, seed, pose_noise, point_noise);
    }

    /// Like [`perturb`](Self::perturb), leaving keyframes below `first_kf` exact.
    pub fn perturb_from(&mut self, first_kf: u64, seed: u64, pose_noise: f64, point_noise: f64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for id in self.map.sorted_keyframe_ids() {
            if id.0 < first_kf {
                continue;
            }
            let delta = Vector6::from_fn(|r, _| {
                let scale = if r < 3 { 0.2 * pose_noise } else { pose_noise };
                rng.gen_range(-scale..scale)
            });
            if let Some(kf) = self.map.get_keyframe_mut(id) {
                kf.pose_cw = kf.pose_cw.retract_left(&delta);
            }
        }
        for id in self.map.sorted_map_point_ids() {
            let noise = Vector3::from_fn(|_, _| rng.gen_range(-point_noise..point_noise));
            if let Some(mp) = self.map.get_map_point_mut(id) {
                mp.position += noise;
            }
        }
    }

    /// Register an ellipsoid with the tight box of its projection in every
    /// keyframe.
    pub fn add_object(&mut self, id: u64, ellipsoid: Ellipsoid) {
        let mut track = ObjectTrack::new(ObjectTrackId::new(id + 10), 0);
        for kf_id in self.map.sorted_keyframe_ids() {
            let Some(kf) = self.map.get_keyframe(kf_id) else {
                continue;
            };
            if let Some(ellipse) = ellipsoid.project(&kf.camera, &kf.pose_cw) {
                let (s, c) = ellipse.angle.sin_cos();
                let (a, b) = (ellipse.axes.x, ellipse.axes.y);
                let half_w = (a * a * c * c + b * b * s * s).sqrt();
                let half_h = (a * a * s * s + b * b * c * c).sqrt();
                track.add_detection(
                    kf_id,
                    BoundingBox::new(
                        ellipse.center.x - half_w,
                        ellipse.center.y - half_h,
                        ellipse.center.x + half_w,
                        ellipse.center.y + half_h,
                    ),
                );
            }
        }
        self.map
            .add_map_object(MapObject::new(MapObjectId::new(id), ellipsoid, track));
    }

    pub fn pose_error(&self, map: &Map, i: usize) -> f64 {
        map.get_keyframe(KeyFrameId::new(i as u64))
            .map(|kf| (kf.pose_cw.translation - self.true_poses[i].translation).norm())
            .unwrap_or(f64::INFINITY)
    }

    pub fn mean_point_error(&self, map: &Map) -> f64 {
        let errors: Vec<f64> = self
            .true_points
            .iter()
            .enumerate()
            .filter_map(|(j, p)| {
                map.get_map_point(MapPointId::new(j as u64))
                    .map(|mp| (mp.position - p).norm())
            })
            .collect();
        errors.iter().sum::<f64>() / errors.len().max(1) as f64
    }
}
