//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the pose nodes of every optimization problem. They carry:
//! - Calibrated observations (keypoints, stereo abscissae, observed planes)
//! - Pose estimate (world-to-camera SE3)
//! - Graph relationships (covisibility, spanning tree, loop edges)
//! - Per-run bookkeeping used by the bundle adjusters

use std::collections::{HashMap, HashSet};

use nalgebra::{Vector2, Vector3};

use crate::geometry::{CameraIntrinsics, Plane3, SE3};

use super::types::{KeyFrameId, MapPlaneId, MapPointId};

/// Undistorted keypoint with its scale-pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub pt: Vector2<f64>,
    pub octave: usize,
}

impl KeyPoint {
    pub fn new(u: f64, v: f64, octave: usize) -> Self {
        Self {
            pt: Vector2::new(u, v),
            octave,
        }
    }
}

/// Per-level scale factors of the feature pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePyramid {
    pub scale_factors: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, n_levels: usize) -> Self {
        let scale_factors: Vec<f64> = (0..n_levels.max(1))
            .map(|level| scale_factor.powi(level as i32))
            .collect();
        let inv_level_sigma2 = scale_factors.iter().map(|s| 1.0 / (s * s)).collect();
        Self {
            scale_factors,
            inv_level_sigma2,
        }
    }

    /// Inverse variance for an observation at `octave`; out-of-range levels
    /// clamp to the coarsest one.
    pub fn inv_sigma2(&self, octave: usize) -> f64 {
        let idx = octave.min(self.inv_level_sigma2.len() - 1);
        self.inv_level_sigma2[idx]
    }

    pub fn scale_factor(&self, octave: usize) -> f64 {
        let idx = octave.min(self.scale_factors.len() - 1);
        self.scale_factors[idx]
    }

    pub fn coarsest_scale(&self) -> f64 {
        self.scale_factors.last().copied().unwrap_or(1.0)
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// World-to-camera transform (T_cw).
    pub pose_cw: SE3,

    pub camera: CameraIntrinsics,
    pub pyramid: ScalePyramid,

    // ─────────────────────────────────────────────────────────────────────────
    // Point Observations
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,

    /// Right-image abscissa per keypoint; negative for monocular observations.
    pub u_right: Vec<f64>,

    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Plane Observations
    // ─────────────────────────────────────────────────────────────────────────
    /// Planes observed in this keyframe, camera frame.
    pub plane_coefficients: Vec<Plane3>,

    /// Observation index → plane matched as the same surface.
    pub map_plane_ids: Vec<Option<MapPlaneId>>,

    /// Observation index → plane matched as parallel.
    pub parallel_plane_ids: Vec<Option<MapPlaneId>>,

    /// Observation index → plane matched as perpendicular.
    pub vertical_plane_ids: Vec<Option<MapPlaneId>>,

    /// Planes inferred but not directly seen (e.g. from scene structure).
    pub not_seen_plane_coefficients: Vec<Plane3>,
    pub not_seen_plane_ids: Vec<Option<MapPlaneId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loops
    // ─────────────────────────────────────────────────────────────────────────
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: HashSet<KeyFrameId>,
    pub loop_edges: HashSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────
    /// Id of the keyframe whose local BA last included this one as local.
    pub ba_local_for_kf: Option<KeyFrameId>,

    /// Id of the keyframe whose local BA last included this one as fixed.
    pub ba_fixed_for_kf: Option<KeyFrameId>,

    /// Loop keyframe of the global BA that staged `pose_gba`.
    pub ba_global_for_kf: Option<KeyFrameId>,

    /// Staged global BA result, applied later by loop closing.
    pub pose_gba: Option<SE3>,

    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a keyframe with `keypoints.len()` empty point slots and no planes.
    pub fn new(
        id: KeyFrameId,
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
            plane_coefficients: Vec::new(),
            map_plane_ids: Vec::new(),
            parallel_plane_ids: Vec::new(),
            vertical_plane_ids: Vec::new(),
            not_seen_plane_coefficients: Vec::new(),
            not_seen_plane_ids: Vec::new(),
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            ba_local_for_kf: None,
            ba_fixed_for_kf: None,
            ba_global_for_kf: None,
            pose_gba: None,
            is_bad: false,
        }
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose_cw.camera_center()
    }

    pub fn is_stereo_observation(&self, feature_idx: usize) -> bool {
        self.u_right.get(feature_idx).is_some_and(|&u| u >= 0.0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Plane Observation Slots
    // ─────────────────────────────────────────────────────────────────────────

    /// Register observed planes (camera frame); all relation slots start empty.
    pub fn set_plane_observations(&mut self, planes: Vec<Plane3>) {
        let n = planes.len();
        self.plane_coefficients = planes;
        self.map_plane_ids = vec![None; n];
        self.parallel_plane_ids = vec![None; n];
        self.vertical_plane_ids = vec![None; n];
    }

    pub fn set_not_seen_plane_observations(&mut self, planes: Vec<Plane3>) {
        let n = planes.len();
        self.not_seen_plane_coefficients = planes;
        self.not_seen_plane_ids = vec![None; n];
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint. Returns the previous association.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Remove whichever slot references `mp_id`.
    pub fn erase_map_point_match(&mut self, mp_id: MapPointId) {
        for slot in self.map_point_ids.iter_mut() {
            if *slot == Some(mp_id) {
                *slot = None;
            }
        }
    }

    /// All associated MapPoint IDs with their feature indices.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// All covisible keyframes, heaviest first (ties broken by id).
    pub fn ordered_covisibles(&self) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().map(|(id, _)| id).collect()
    }

    /// Covisible keyframes sharing at least `min_weight` points.
    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        let mut above: Vec<KeyFrameId> = self
            .covisibility_weights
            .iter()
            .filter(|(_, w)| **w >= min_weight)
            .map(|(id, _)| *id)
            .collect();
        above.sort();
        above
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loops
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        self.loop_edges.insert(kf_id);
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("num_features", &self.keypoints.len())
            .field("num_map_points", &self.num_map_points())
            .field("num_planes", &self.plane_coefficients.len())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
