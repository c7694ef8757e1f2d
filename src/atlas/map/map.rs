//! Map - Container for keyframes and every landmark kind.
//!
//! The Map owns all entities exclusively; relations between them are id-based
//! back-references kept symmetric by the methods in this file:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`, MP → KF via `observations`)
//! - KeyFrames observe MapPlanes under four relations (seen, not-seen, parallel, vertical)
//! - MapObjects carry per-keyframe detections through their track
//!
//! Seen and not-seen planes live in separate registries although they share
//! one id space.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;

use super::keyframe::KeyFrame;
use super::map_object::MapObject;
use super::map_plane::{MapPlane, PlaneRelation};
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapObjectId, MapPlaneId, MapPointId};

pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    map_planes: HashMap<MapPlaneId, MapPlane>,
    seen_planes: BTreeSet<MapPlaneId>,
    not_seen_planes: BTreeSet<MapPlaneId>,
    map_objects: HashMap<MapObjectId, MapObject>,

    next_kf_id: u64,
    next_plane_id: u64,
    next_object_id: u64,

    max_kf_id: Option<KeyFrameId>,

    /// Incremented on loop closure and global BA so other threads can detect
    /// that poses moved under them.
    big_change_idx: u64,

    reference_map_points: Vec<MapPointId>,
    keyframe_origins: Vec<KeyFrameId>,
    removed_planes: Vec<MapPlaneId>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            map_planes: HashMap::new(),
            seen_planes: BTreeSet::new(),
            not_seen_planes: BTreeSet::new(),
            map_objects: HashMap::new(),
            next_kf_id: 0,
            next_plane_id: 0,
            next_object_id: 0,
            max_kf_id: None,
            big_change_idx: 0,
            reference_map_points: Vec::new(),
            keyframe_origins: Vec::new(),
            removed_planes: Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn next_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn next_plane_id(&mut self) -> MapPlaneId {
        let id = MapPlaneId::new(self.next_plane_id);
        self.next_plane_id += 1;
        id
    }

    pub fn next_object_id(&mut self) -> MapObjectId {
        let id = MapObjectId::new(self.next_object_id);
        self.next_object_id += 1;
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a keyframe. The first keyframe becomes a map origin.
    pub fn add_keyframe(&mut self, kf: KeyFrame) {
        let id = kf.id;
        if self.keyframes.is_empty() {
            self.keyframe_origins.push(id);
        }
        self.next_kf_id = self.next_kf_id.max(id.0 + 1);
        if self.max_kf_id.map_or(true, |max| id > max) {
            self.max_kf_id = Some(id);
        }
        self.keyframes.insert(id, kf);
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    /// Keyframe ids in ascending order.
    pub fn sorted_keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn max_keyframe_id(&self) -> Option<KeyFrameId> {
        self.max_kf_id
    }

    pub fn keyframe_origins(&self) -> &[KeyFrameId] {
        &self.keyframe_origins
    }

    /// Link `child` under `parent` in the spanning tree.
    pub fn set_spanning_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) -> bool {
        if !self.keyframes.contains_key(&parent) {
            return false;
        }
        let Some(kf) = self.keyframes.get_mut(&child) else {
            return false;
        };
        kf.set_parent(parent);
        if let Some(p) = self.keyframes.get_mut(&parent) {
            p.add_child(child);
        }
        true
    }

    /// Record a loop edge on both keyframes.
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.add_loop_edge(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.add_loop_edge(a);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_map_point(&mut self, mp: MapPoint) {
        self.map_points.insert(mp.id, mp);
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn sorted_map_point_ids(&self) -> Vec<MapPointId> {
        let mut ids: Vec<MapPointId> = self.map_points.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    pub fn max_map_point_id(&self) -> Option<MapPointId> {
        self.map_points.keys().max().copied()
    }

    pub fn set_reference_map_points(&mut self, ids: Vec<MapPointId>) {
        self.reference_map_points = ids;
    }

    pub fn reference_map_points(&self) -> &[MapPointId] {
        &self.reference_map_points
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPlane Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a plane in the seen or not-seen registry according to its flag.
    pub fn add_map_plane(&mut self, plane: MapPlane) {
        let id = plane.id;
        self.next_plane_id = self.next_plane_id.max(id.0 + 1);
        if plane.seen {
            self.seen_planes.insert(id);
        } else {
            self.not_seen_planes.insert(id);
        }
        self.map_planes.insert(id, plane);
    }

    pub fn get_map_plane(&self, id: MapPlaneId) -> Option<&MapPlane> {
        self.map_planes.get(&id)
    }

    pub fn get_map_plane_mut(&mut self, id: MapPlaneId) -> Option<&mut MapPlane> {
        self.map_planes.get_mut(&id)
    }

    /// Seen-plane registry in id order.
    pub fn seen_plane_ids(&self) -> impl Iterator<Item = &MapPlaneId> {
        self.seen_planes.iter()
    }

    /// Not-seen-plane registry in id order.
    pub fn not_seen_plane_ids(&self) -> impl Iterator<Item = &MapPlaneId> {
        self.not_seen_planes.iter()
    }

    pub fn max_map_plane_id(&self) -> Option<MapPlaneId> {
        self.map_planes.keys().max().copied()
    }

    /// Move a not-seen plane into the seen registry.
    pub fn promote_to_seen(&mut self, id: MapPlaneId) {
        if self.not_seen_planes.remove(&id) {
            self.seen_planes.insert(id);
        }
        if let Some(plane) = self.map_planes.get_mut(&id) {
            plane.seen = true;
        }
    }

    /// Move a seen plane back into the not-seen registry.
    pub fn demote_to_not_seen(&mut self, id: MapPlaneId) {
        if self.seen_planes.remove(&id) {
            self.not_seen_planes.insert(id);
        }
        if let Some(plane) = self.map_planes.get_mut(&id) {
            plane.seen = false;
        }
    }

    pub fn num_seen_planes(&self) -> usize {
        self.seen_planes.len()
    }

    pub fn num_not_seen_planes(&self) -> usize {
        self.not_seen_planes.len()
    }

    /// Drop a plane from both registries and detach it from all keyframes.
    pub fn erase_map_plane(&mut self, id: MapPlaneId) -> Option<MapPlane> {
        let plane = self.map_planes.remove(&id)?;
        self.seen_planes.remove(&id);
        self.not_seen_planes.remove(&id);
        for relation in PlaneRelation::ALL {
            for (kf_id, idx) in plane.observations(relation) {
                if let Some(slot) = self
                    .keyframes
                    .get_mut(kf_id)
                    .and_then(|kf| plane_slots_mut(kf, relation).get_mut(*idx))
                {
                    *slot = None;
                }
            }
        }
        self.removed_planes.push(id);
        Some(plane)
    }

    pub fn removed_planes(&self) -> &[MapPlaneId] {
        &self.removed_planes
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapObject Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_map_object(&mut self, object: MapObject) {
        self.next_object_id = self.next_object_id.max(object.id.0 + 1);
        self.map_objects.insert(object.id, object);
    }

    pub fn get_map_object(&self, id: MapObjectId) -> Option<&MapObject> {
        self.map_objects.get(&id)
    }

    pub fn get_map_object_mut(&mut self, id: MapObjectId) -> Option<&mut MapObject> {
        self.map_objects.get_mut(&id)
    }

    pub fn map_objects(&self) -> impl Iterator<Item = &MapObject> {
        self.map_objects.values()
    }

    pub fn sorted_map_object_ids(&self) -> Vec<MapObjectId> {
        let mut ids: Vec<MapObjectId> = self.map_objects.keys().copied().collect();
        ids.sort();
        ids
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a keyframe feature and a
    /// MapPoint, bumping covisibility with every other observer.
    ///
    /// Returns false if either entity is unknown or the feature index is out of range.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let in_range = self
            .keyframes
            .get(&kf_id)
            .is_some_and(|kf| feature_idx < kf.map_point_ids.len());
        if !in_range {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                let observers = mp.observations.keys().copied().collect();
                mp.add_observation(kf_id, feature_idx);
                observers
            }
            None => return false,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            if other_kf_id == kf_id {
                continue;
            }
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the keyframe ↔ point relation from both sides.
    ///
    /// The point's reference keyframe moves to another observer if needed; a
    /// point left without observers is marked bad. Covisibility weights are
    /// left to the next connection update.
    pub fn erase_point_observation(&mut self, kf_id: KeyFrameId, mp_id: MapPointId) -> bool {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point_match(mp_id);
        }
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return false;
        };
        let existed = mp.erase_observation(kf_id);
        if mp.reference_kf == kf_id {
            if let Some((next_ref, _)) = mp.sorted_observations().first() {
                mp.reference_kf = *next_ref;
            }
        }
        if mp.observations.is_empty() {
            mp.set_bad();
        }
        existed
    }

    /// Mark a point bad and unlink it from every observing keyframe.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return;
        };
        mp.set_bad();
        let observers: Vec<KeyFrameId> = mp.observations.drain().map(|(kf, _)| kf).collect();
        for kf_id in observers {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_map_point_match(mp_id);
            }
        }
    }

    /// Mark a keyframe bad and unlink it from points, planes, covisibility,
    /// and the spanning tree. Its children are re-parented to its parent.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return;
        };
        kf.set_bad();
        let points: Vec<MapPointId> = kf.get_map_point_indices().map(|(_, mp)| mp).collect();
        let covisibles: Vec<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();
        let parent = kf.parent_id;
        let children: Vec<KeyFrameId> = kf.children_ids.drain().collect();

        for mp_id in points {
            self.erase_point_observation(kf_id, mp_id);
        }
        for relation in PlaneRelation::ALL {
            let planes: Vec<MapPlaneId> = self
                .keyframes
                .get_mut(&kf_id)
                .map(|kf| plane_slots_mut(kf, relation).iter().flatten().copied().collect())
                .unwrap_or_default();
            for plane_id in planes {
                self.erase_plane_observation(relation, kf_id, plane_id);
            }
        }
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            for other in kf.covisibility_weights().keys().copied().collect::<Vec<_>>() {
                kf.erase_covisibility(other);
            }
        }
        if let Some(parent_id) = parent {
            if let Some(p) = self.keyframes.get_mut(&parent_id) {
                p.erase_child(kf_id);
            }
            for child in children {
                self.set_spanning_parent(child, parent_id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ Plane)
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that observation `idx` of `kf_id` relates to `plane_id`.
    pub fn associate_plane(
        &mut self,
        relation: PlaneRelation,
        kf_id: KeyFrameId,
        idx: usize,
        plane_id: MapPlaneId,
    ) -> bool {
        if !self.map_planes.contains_key(&plane_id) {
            return false;
        }
        let Some(slot) = self
            .keyframes
            .get_mut(&kf_id)
            .and_then(|kf| plane_slots_mut(kf, relation).get_mut(idx))
        else {
            return false;
        };
        *slot = Some(plane_id);
        if let Some(plane) = self.map_planes.get_mut(&plane_id) {
            plane.add_observation(relation, kf_id, idx);
        }
        if relation == PlaneRelation::Seen {
            self.promote_to_seen(plane_id);
        }
        true
    }

    /// Remove one plane relation from both sides.
    pub fn erase_plane_observation(
        &mut self,
        relation: PlaneRelation,
        kf_id: KeyFrameId,
        plane_id: MapPlaneId,
    ) -> bool {
        let Some(idx) = self
            .map_planes
            .get_mut(&plane_id)
            .and_then(|plane| plane.erase_observation(relation, kf_id))
        else {
            return false;
        };
        if let Some(slot) = self
            .keyframes
            .get_mut(&kf_id)
            .and_then(|kf| plane_slots_mut(kf, relation).get_mut(idx))
        {
            if *slot == Some(plane_id) {
                *slot = None;
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute the mean viewing direction and scale-invariance distances of
    /// a MapPoint from its current observers.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        if mp.is_bad || mp.observations.is_empty() {
            return;
        }
        let position = mp.position;

        let mut normal = Vector3::zeros();
        let mut n = 0usize;
        for kf_id in mp.observations.keys() {
            if let Some(kf) = self.keyframes.get(kf_id) {
                let dir = position - kf.camera_center();
                if dir.norm() > 0.0 {
                    normal += dir.normalize();
                    n += 1;
                }
            }
        }

        let depth_limits = self.keyframes.get(&mp.reference_kf).and_then(|ref_kf| {
            let idx = mp.observations.get(&mp.reference_kf)?;
            let octave = ref_kf.keypoints.get(*idx)?.octave;
            let dist = (position - ref_kf.camera_center()).norm();
            let max_distance = dist * ref_kf.pyramid.scale_factor(octave);
            Some((max_distance / ref_kf.pyramid.coarsest_scale(), max_distance))
        });

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if n > 0 {
                mp.normal = (normal / n as f64).normalize();
            }
            if let Some((min_distance, max_distance)) = depth_limits {
                mp.min_distance = min_distance;
                mp.max_distance = max_distance;
            }
        }
    }

    pub fn inform_new_big_change(&mut self) {
        self.big_change_idx += 1;
    }

    pub fn last_big_change_idx(&self) -> u64 {
        self.big_change_idx
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Keyframe slot vector holding the plane matches of one relation.
fn plane_slots_mut(kf: &mut KeyFrame, relation: PlaneRelation) -> &mut Vec<Option<MapPlaneId>> {
    match relation {
        PlaneRelation::Seen => &mut kf.map_plane_ids,
        PlaneRelation::NotSeen => &mut kf.not_seen_plane_ids,
        PlaneRelation::Parallel => &mut kf.parallel_plane_ids,
        PlaneRelation::Vertical => &mut kf.vertical_plane_ids,
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("num_seen_planes", &self.seen_planes.len())
            .field("num_not_seen_planes", &self.not_seen_planes.len())
            .field("num_objects", &self.map_objects.len())
            .finish()
    }
}
