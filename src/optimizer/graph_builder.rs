//! Converts a map snapshot into vertices and edges for an optimization engine.
//!
//! The builder borrows the map only while collecting; [`Graph`] owns
//! everything it needs so it can be solved after the lock is released. Every
//! edge carries an [`EdgeTag`] naming the map relation it came from, which is
//! what the adjusters use to classify outliers and erase relations.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, Vector3};

use crate::atlas::map::{
    KeyFrame, KeyFrameId, KeyPoint, Map, MapObjectId, MapPlaneId, MapPointId, ObjectTrackId,
    PlaneRelation, ScalePyramid,
};
use crate::geometry::{CameraIntrinsics, Plane3};

use super::engine::{Edge, EdgeId, OptimizationEngine};
use super::factors::{Factor, Vertex, VertexEstimate, VertexId};
use super::robust::{FactorKind, RobustPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Id allocation
// ─────────────────────────────────────────────────────────────────────────────

/// A contiguous block of engine ids, one per raw entity id `0..len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexRange {
    pub start: VertexId,
    pub len: usize,
}

impl VertexRange {
    fn after(previous: Option<&VertexRange>, max_raw: Option<u64>) -> Self {
        let start = previous.map_or(0, VertexRange::end);
        let len = max_raw.map_or(0, |m| m as usize + 1);
        Self { start, len }
    }

    pub fn end(&self) -> VertexId {
        self.start + self.len
    }

    pub fn id(&self, raw: u64) -> Option<VertexId> {
        let raw = raw as usize;
        (raw < self.len).then(|| self.start + raw)
    }

    pub fn contains(&self, id: VertexId) -> bool {
        (self.start..self.end()).contains(&id)
    }
}

/// Disjoint engine-id ranges, laid out back to back:
/// keyframes, points, planes, not-seen planes, parallel and vertical plane
/// copies, objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdAllocator {
    pub keyframes: VertexRange,
    pub points: VertexRange,
    pub planes: VertexRange,
    pub not_seen_planes: VertexRange,
    pub parallel_planes: VertexRange,
    pub vertical_planes: VertexRange,
    pub objects: VertexRange,
}

impl IdAllocator {
    pub fn new(
        max_keyframe: Option<u64>,
        max_point: Option<u64>,
        max_plane: Option<u64>,
        max_track: Option<u64>,
    ) -> Self {
        let keyframes = VertexRange::after(None, max_keyframe);
        let points = VertexRange::after(Some(&keyframes), max_point);
        let planes = VertexRange::after(Some(&points), max_plane);
        let not_seen_planes = VertexRange::after(Some(&planes), max_plane);
        let parallel_planes = VertexRange::after(Some(&not_seen_planes), max_plane);
        let vertical_planes = VertexRange::after(Some(&parallel_planes), max_plane);
        let objects = VertexRange::after(Some(&vertical_planes), max_track);
        Self {
            keyframes,
            points,
            planes,
            not_seen_planes,
            parallel_planes,
            vertical_planes,
            objects,
        }
    }

    pub fn from_map(map: &Map) -> Self {
        let max_track = map.map_objects().map(|o| o.track_id().0).max();
        Self::new(
            map.max_keyframe_id().map(|id| id.0),
            map.max_map_point_id().map(|id| id.0),
            map.max_map_plane_id().map(|id| id.0),
            max_track,
        )
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<VertexId> {
        self.keyframes.id(id.0)
    }

    pub fn point(&self, id: MapPointId) -> Option<VertexId> {
        self.points.id(id.0)
    }

    /// A plane has one vertex, placed by the registry it belongs to.
    pub fn plane(&self, id: MapPlaneId, seen: bool) -> Option<VertexId> {
        if seen {
            self.planes.id(id.0)
        } else {
            self.not_seen_planes.id(id.0)
        }
    }

    /// Per-relation plane vertex, for graphs that hold one fixed copy of a
    /// plane per relation it is observed under.
    pub fn plane_for_relation(&self, relation: PlaneRelation, id: MapPlaneId) -> Option<VertexId> {
        match relation {
            PlaneRelation::Seen => self.planes.id(id.0),
            PlaneRelation::NotSeen => self.not_seen_planes.id(id.0),
            PlaneRelation::Parallel => self.parallel_planes.id(id.0),
            PlaneRelation::Vertical => self.vertical_planes.id(id.0),
        }
    }

    pub fn object(&self, track: ObjectTrackId) -> Option<VertexId> {
        self.objects.id(track.0)
    }

    /// Total number of ids spanned by all ranges.
    pub fn total(&self) -> usize {
        self.objects.end()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Edge tags and factor construction
// ─────────────────────────────────────────────────────────────────────────────

/// Map relation an edge was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeTag {
    Point {
        kind: FactorKind,
        keyframe: KeyFrameId,
        point: MapPointId,
        feature_idx: usize,
    },
    Plane {
        relation: PlaneRelation,
        keyframe: KeyFrameId,
        plane: MapPlaneId,
        observation_idx: usize,
    },
    Object {
        keyframe: KeyFrameId,
        object: MapObjectId,
    },
}

impl EdgeTag {
    /// Kind used for χ² gating; objects are never gated.
    pub fn factor_kind(&self) -> Option<FactorKind> {
        match self {
            EdgeTag::Point { kind, .. } => Some(*kind),
            EdgeTag::Plane { relation, .. } => Some((*relation).into()),
            EdgeTag::Object { .. } => None,
        }
    }
}

/// Reprojection edge of one keypoint; stereo when the right abscissa is valid.
#[allow(clippy::too_many_arguments)]
pub fn point_edge(
    policy: &RobustPolicy,
    camera: &CameraIntrinsics,
    pyramid: &ScalePyramid,
    pose: VertexId,
    point: VertexId,
    keypoint: &KeyPoint,
    u_right: f64,
    robust: bool,
) -> (FactorKind, Edge) {
    let inv_sigma2 = pyramid.inv_sigma2(keypoint.octave);
    let (kind, factor) = if u_right < 0.0 {
        (
            FactorKind::Mono,
            Factor::MonoProjection {
                pose,
                point,
                measurement: keypoint.pt,
                camera: *camera,
            },
        )
    } else {
        (
            FactorKind::Stereo,
            Factor::StereoProjection {
                pose,
                point,
                measurement: Vector3::new(keypoint.pt.x, keypoint.pt.y, u_right),
                camera: *camera,
            },
        )
    };
    let mut edge = Edge::new(factor, policy.reprojection_information(kind, inv_sigma2));
    if robust {
        edge = edge.with_huber(policy.huber_delta(kind));
    }
    (kind, edge)
}

/// Parameters of one plane factor: which relation, how strongly it is
/// weighted, and the χ² bound its Huber width derives from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFactorParams {
    pub relation: PlaneRelation,
    pub information_scale: f64,
    pub chi2_bound: f64,
}

impl PlaneFactorParams {
    pub fn new(policy: &RobustPolicy, relation: PlaneRelation) -> Self {
        Self {
            relation,
            information_scale: 1.0,
            chi2_bound: policy.chi2_bound(relation.into()),
        }
    }

    pub fn with_information_scale(mut self, scale: f64) -> Self {
        self.information_scale = scale;
        self
    }

    pub fn edge(
        &self,
        policy: &RobustPolicy,
        pose: VertexId,
        plane: VertexId,
        measurement: Plane3,
        robust: bool,
    ) -> Edge {
        let factor = match self.relation {
            PlaneRelation::Seen | PlaneRelation::NotSeen => Factor::Plane {
                pose,
                plane,
                measurement,
            },
            PlaneRelation::Parallel => Factor::ParallelPlane {
                pose,
                plane,
                measurement,
            },
            PlaneRelation::Vertical => Factor::VerticalPlane {
                pose,
                plane,
                measurement,
            },
        };
        let edge = Edge::new(
            factor,
            policy.plane_information(self.relation, self.information_scale),
        );
        if robust {
            edge.with_huber(self.chi2_bound.sqrt())
        } else {
            edge
        }
    }
}

/// Observed coefficients behind a plane relation slot. Parallel and vertical
/// matches refer to the regular plane observations.
pub fn observed_plane(
    plane_coefficients: &[Plane3],
    not_seen_plane_coefficients: &[Plane3],
    relation: PlaneRelation,
    idx: usize,
) -> Option<Plane3> {
    match relation {
        PlaneRelation::NotSeen => not_seen_plane_coefficients.get(idx).copied(),
        _ => plane_coefficients.get(idx).copied(),
    }
}

fn keyframe_plane(kf: &KeyFrame, relation: PlaneRelation, idx: usize) -> Option<Plane3> {
    observed_plane(
        &kf.plane_coefficients,
        &kf.not_seen_plane_coefficients,
        relation,
        idx,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// An owned optimization problem, ready to load into an engine.
#[derive(Debug, Clone)]
pub struct Graph {
    pub ids: IdAllocator,
    pub vertices: Vec<Vertex>,
    pub edges: Vec<(EdgeTag, Edge)>,
}

impl Graph {
    /// Load everything into `engine`; edges the engine rejects are dropped.
    pub fn load_into<E: OptimizationEngine>(self, engine: &mut E) -> Vec<(EdgeTag, EdgeId)> {
        for vertex in self.vertices {
            engine.add_vertex(vertex);
        }
        self.edges
            .into_iter()
            .filter_map(|(tag, edge)| engine.add_edge(edge).map(|id| (tag, id)))
            .collect()
    }
}

pub struct GraphBuilder<'a> {
    map: &'a Map,
    ids: IdAllocator,
    policy: RobustPolicy,
    robust: bool,
    vertices: BTreeMap<VertexId, Vertex>,
    edges: Vec<(EdgeTag, Edge)>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(map: &'a Map, policy: RobustPolicy) -> Self {
        Self {
            map,
            ids: IdAllocator::from_map(map),
            policy,
            robust: true,
            vertices: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    /// Attach Huber kernels to edges built from now on.
    pub fn set_robust(&mut self, robust: bool) {
        self.robust = robust;
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn has_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains_key(&id)
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Drop a vertex together with the edges built on it.
    pub fn remove_vertex(&mut self, id: VertexId) -> bool {
        if self.vertices.remove(&id).is_none() {
            return false;
        }
        self.edges
            .retain(|(_, edge)| !edge.factor.vertices().contains(&id));
        true
    }

    fn insert_vertex(&mut self, vertex: Vertex) -> VertexId {
        let id = vertex.id;
        self.vertices.entry(id).or_insert(vertex);
        id
    }

    /// Pose vertex; keyframe 0 is always fixed.
    pub fn add_keyframe(&mut self, kf_id: KeyFrameId, fixed: bool) -> Option<VertexId> {
        let kf = self.map.get_keyframe(kf_id).filter(|kf| !kf.is_bad)?;
        let id = self.ids.keyframe(kf_id)?;
        let fixed = fixed || kf_id.0 == 0;
        Some(self.insert_vertex(Vertex::new(id, VertexEstimate::Pose(kf.pose_cw)).fixed(fixed)))
    }

    /// Marginalized point vertex.
    pub fn add_point(&mut self, mp_id: MapPointId) -> Option<VertexId> {
        let mp = self.map.get_map_point(mp_id).filter(|mp| !mp.is_bad)?;
        let id = self.ids.point(mp_id)?;
        Some(self.insert_vertex(
            Vertex::new(id, VertexEstimate::Point(mp.position)).marginalized(true),
        ))
    }

    /// Marginalized plane vertex, in the range of the plane's registry.
    pub fn add_plane(&mut self, plane_id: MapPlaneId) -> Option<VertexId> {
        let plane = self.map.get_map_plane(plane_id).filter(|p| !p.is_bad)?;
        let id = self.ids.plane(plane_id, plane.seen)?;
        Some(self.insert_vertex(
            Vertex::new(id, VertexEstimate::Plane(plane.plane)).marginalized(true),
        ))
    }

    /// Marginalized ellipsoid vertex keyed by the object's track.
    pub fn add_object(&mut self, object_id: MapObjectId) -> Option<VertexId> {
        let object = self.map.get_map_object(object_id).filter(|o| !o.is_bad)?;
        let id = self.ids.object(object.track_id())?;
        Some(self.insert_vertex(
            Vertex::new(id, VertexEstimate::Ellipsoid(object.ellipsoid)).marginalized(true),
        ))
    }

    pub fn plane_vertex(&self, plane_id: MapPlaneId) -> Option<VertexId> {
        let plane = self.map.get_map_plane(plane_id)?;
        self.ids.plane(plane_id, plane.seen)
    }

    /// Reprojection edge of feature `feature_idx` of `kf_id`. Both vertices
    /// must already be in the graph.
    pub fn add_point_observation(
        &mut self,
        kf_id: KeyFrameId,
        mp_id: MapPointId,
        feature_idx: usize,
    ) -> bool {
        let map = self.map;
        let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
            return false;
        };
        let (Some(pose), Some(point)) = (self.ids.keyframe(kf_id), self.ids.point(mp_id)) else {
            return false;
        };
        if !self.has_vertex(pose) || !self.has_vertex(point) {
            return false;
        }
        let Some(keypoint) = kf.keypoints.get(feature_idx) else {
            return false;
        };
        let u_right = kf.u_right.get(feature_idx).copied().unwrap_or(-1.0);
        let (kind, edge) = point_edge(
            &self.policy,
            &kf.camera,
            &kf.pyramid,
            pose,
            point,
            keypoint,
            u_right,
            self.robust,
        );
        self.edges.push((
            EdgeTag::Point {
                kind,
                keyframe: kf_id,
                point: mp_id,
                feature_idx,
            },
            edge,
        ));
        true
    }

    /// Edges for every observation of the point whose keyframe has a vertex.
    pub fn add_point_observations(&mut self, mp_id: MapPointId) -> usize {
        let map = self.map;
        let Some(mp) = map.get_map_point(mp_id) else {
            return 0;
        };
        mp.sorted_observations()
            .into_iter()
            .filter(|&(kf_id, idx)| self.add_point_observation(kf_id, mp_id, idx))
            .count()
    }

    /// The one plane-factor operation shared by all four relations.
    pub fn add_plane_factor(
        &mut self,
        params: PlaneFactorParams,
        kf_id: KeyFrameId,
        plane_id: MapPlaneId,
        observation_idx: usize,
    ) -> bool {
        let map = self.map;
        let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
            return false;
        };
        let (Some(pose), Some(plane)) = (self.ids.keyframe(kf_id), self.plane_vertex(plane_id))
        else {
            return false;
        };
        if !self.has_vertex(pose) || !self.has_vertex(plane) {
            return false;
        }
        let Some(measurement) = keyframe_plane(kf, params.relation, observation_idx) else {
            return false;
        };
        let edge = params.edge(&self.policy, pose, plane, measurement, self.robust);
        self.edges.push((
            EdgeTag::Plane {
                relation: params.relation,
                keyframe: kf_id,
                plane: plane_id,
                observation_idx,
            },
            edge,
        ));
        true
    }

    /// Edges for all four relations of a plane, at standard weighting.
    pub fn add_plane_observations(&mut self, plane_id: MapPlaneId) -> usize {
        let map = self.map;
        let Some(plane) = map.get_map_plane(plane_id) else {
            return 0;
        };
        let mut added = 0;
        for relation in PlaneRelation::ALL {
            let params = PlaneFactorParams::new(&self.policy, relation);
            for (kf_id, idx) in plane.sorted_observations(relation) {
                if self.add_plane_factor(params, kf_id, plane_id, idx) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Pose-only edge against the object's current ellipsoid.
    pub fn add_object_detection(&mut self, kf_id: KeyFrameId, object_id: MapObjectId) -> bool {
        let Some((kf, object)) = self.object_observation(kf_id, object_id) else {
            return false;
        };
        let Some(pose) = self.ids.keyframe(kf_id).filter(|id| self.has_vertex(*id)) else {
            return false;
        };
        let Some(bbox) = object.track.detection(kf_id) else {
            return false;
        };
        let factor = Factor::ObjectDetection {
            pose,
            ellipsoid: object.ellipsoid,
            detection: bbox.inscribed_ellipse(),
            camera: kf.camera,
        };
        self.edges.push((
            EdgeTag::Object {
                keyframe: kf_id,
                object: object_id,
            },
            Edge::new(factor, DMatrix::identity(1, 1)),
        ));
        true
    }

    /// Edge between a pose and the object's ellipsoid vertex.
    pub fn add_object_shape_detection(
        &mut self,
        kf_id: KeyFrameId,
        object_id: MapObjectId,
    ) -> bool {
        let Some((kf, object)) = self.object_observation(kf_id, object_id) else {
            return false;
        };
        let pose = self.ids.keyframe(kf_id).filter(|id| self.has_vertex(*id));
        let ellipsoid = self
            .ids
            .object(object.track_id())
            .filter(|id| self.has_vertex(*id));
        let (Some(pose), Some(ellipsoid)) = (pose, ellipsoid) else {
            return false;
        };
        let Some(bbox) = object.track.detection(kf_id) else {
            return false;
        };
        let factor = Factor::ObjectShape {
            pose,
            ellipsoid,
            detection: bbox.inscribed_ellipse(),
            camera: kf.camera,
        };
        self.edges.push((
            EdgeTag::Object {
                keyframe: kf_id,
                object: object_id,
            },
            Edge::new(factor, DMatrix::identity(1, 1)),
        ));
        true
    }

    fn object_observation(
        &self,
        kf_id: KeyFrameId,
        object_id: MapObjectId,
    ) -> Option<(&'a KeyFrame, &'a crate::atlas::map::MapObject)> {
        let map: &'a Map = self.map;
        let kf = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad)?;
        let object = map.get_map_object(object_id).filter(|o| !o.is_bad)?;
        Some((kf, object))
    }

    pub fn finish(self) -> Graph {
        Graph {
            ids: self.ids,
            vertices: self.vertices.into_values().collect(),
            edges: self.edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{MapObject, MapPlane, MapPoint, ObjectTrack};
    use crate::geometry::{BoundingBox, Ellipsoid, SE3};
    use crate::optimizer::lm::LevenbergMarquardt;
    use nalgebra::UnitQuaternion;
    use std::collections::HashSet;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0).with_stereo_baseline(40.0)
    }

    fn small_map() -> Map {
        let mut map = Map::new();
        for i in 0..3u64 {
            let keypoints = vec![KeyPoint::new(320.0, 240.0, 0), KeyPoint::new(300.0, 200.0, 1)];
            let mut kf = KeyFrame::new(
                KeyFrameId::new(i),
                i as f64,
                SE3::new(UnitQuaternion::identity(), Vector3::new(-0.1 * i as f64, 0.0, 0.0)),
                camera(),
                keypoints,
                vec![-1.0, 310.0],
            );
            kf.set_plane_observations(vec![Plane3::new(Vector3::z(), -3.0)]);
            kf.set_not_seen_plane_observations(vec![Plane3::new(Vector3::x(), -1.0)]);
            map.add_keyframe(kf);
        }
        for j in 0..2u64 {
            map.add_map_point(MapPoint::new(
                MapPointId::new(j),
                Vector3::new(0.0, 0.0, 4.0 + j as f64),
                KeyFrameId::new(0),
            ));
            for i in 0..3u64 {
                assert!(map.associate(KeyFrameId::new(i), j as usize, MapPointId::new(j)));
            }
        }
        let ground = Plane3::new(Vector3::z(), -3.0);
        let side = Plane3::new(Vector3::x(), -1.0);
        map.add_map_plane(MapPlane::new(MapPlaneId::new(0), ground, true));
        map.add_map_plane(MapPlane::new(MapPlaneId::new(1), side, false));
        for i in 0..3u64 {
            map.associate_plane(PlaneRelation::Seen, KeyFrameId::new(i), 0, MapPlaneId::new(0));
            map.associate_plane(PlaneRelation::NotSeen, KeyFrameId::new(i), 0, MapPlaneId::new(1));
        }
        let mut track = ObjectTrack::new(ObjectTrackId::new(4), 1);
        track.add_detection(KeyFrameId::new(1), BoundingBox::new(300.0, 220.0, 340.0, 260.0));
        map.add_map_object(MapObject::new(
            MapObjectId::new(0),
            Ellipsoid::new(
                Vector3::new(0.0, 0.0, 5.0),
                UnitQuaternion::identity(),
                Vector3::repeat(0.2),
            ),
            track,
        ));
        map
    }

    #[test]
    fn test_ranges_are_disjoint_and_ordered() {
        let ids = IdAllocator::new(Some(4), Some(9), Some(2), Some(3));
        let ranges = [
            ids.keyframes,
            ids.points,
            ids.planes,
            ids.not_seen_planes,
            ids.parallel_planes,
            ids.vertical_planes,
            ids.objects,
        ];
        let mut seen = HashSet::new();
        for r in &ranges {
            for id in r.start..r.end() {
                assert!(seen.insert(id), "id {} allocated twice", id);
            }
        }
        assert_eq!(ids.points.start, 5);
        assert_eq!(ids.planes.start, 15);
        assert_eq!(ids.total(), 5 + 10 + 4 * 3 + 4);
        assert_eq!(ids.point(MapPointId::new(10)), None);
    }

    #[test]
    fn test_empty_ranges_take_no_ids() {
        let ids = IdAllocator::new(Some(0), None, None, None);
        assert_eq!(ids.points.len, 0);
        assert_eq!(ids.objects.start, 1);
        assert_eq!(ids.plane(MapPlaneId::new(0), true), None);
    }

    #[test]
    fn test_builder_skips_bad_entities_and_missing_vertices() {
        let mut map = small_map();
        map.get_keyframe_mut(KeyFrameId::new(2)).unwrap().is_bad = true;
        let mut builder = GraphBuilder::new(&map, RobustPolicy::default());
        assert!(builder.add_keyframe(KeyFrameId::new(2), false).is_none());
        builder.add_keyframe(KeyFrameId::new(0), false);
        builder.add_keyframe(KeyFrameId::new(1), false);

        let p = builder.add_point(MapPointId::new(0)).unwrap();
        assert_eq!(builder.add_point_observations(MapPointId::new(0)), 2);
        // Point 1 has no vertex yet.
        assert!(!builder.add_point_observation(KeyFrameId::new(0), MapPointId::new(1), 1));

        let graph = builder.finish();
        let origin = graph.vertices.iter().find(|v| v.id == 0).unwrap();
        assert!(origin.fixed);
        assert!(graph.vertices.iter().find(|v| v.id == p).unwrap().marginalized);
    }

    #[test]
    fn test_stereo_and_mono_point_edges() {
        let map = small_map();
        let mut builder = GraphBuilder::new(&map, RobustPolicy::default());
        builder.add_keyframe(KeyFrameId::new(0), false);
        builder.add_point(MapPointId::new(0));
        builder.add_point(MapPointId::new(1));
        builder.add_point_observations(MapPointId::new(0));
        builder.add_point_observations(MapPointId::new(1));
        let graph = builder.finish();
        let kinds: Vec<FactorKind> = graph
            .edges
            .iter()
            .filter_map(|(tag, _)| tag.factor_kind())
            .collect();
        assert_eq!(kinds, vec![FactorKind::Mono, FactorKind::Stereo]);
        assert_eq!(graph.edges[1].1.information.shape(), (3, 3));
    }

    #[test]
    fn test_plane_vertices_follow_registry() {
        let map = small_map();
        let mut builder = GraphBuilder::new(&map, RobustPolicy::default());
        let seen = builder.add_plane(MapPlaneId::new(0)).unwrap();
        let not_seen = builder.add_plane(MapPlaneId::new(1)).unwrap();
        assert!(builder.ids().planes.contains(seen));
        assert!(builder.ids().not_seen_planes.contains(not_seen));

        for i in 0..3 {
            builder.add_keyframe(KeyFrameId::new(i), false);
        }
        assert_eq!(builder.add_plane_observations(MapPlaneId::new(0)), 3);
        assert_eq!(builder.add_plane_observations(MapPlaneId::new(1)), 3);

        let graph = builder.finish();
        let (seen_edge, not_seen_edge) = (&graph.edges[0].1, &graph.edges[3].1);
        assert_eq!(not_seen_edge.information, &seen_edge.information * 0.5);
        let seen_delta = seen_edge.robust_delta.unwrap();
        let not_seen_delta = not_seen_edge.robust_delta.unwrap();
        approx::assert_relative_eq!(
            not_seen_delta * not_seen_delta,
            seen_delta * seen_delta / 2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_object_edges_and_loading() {
        let map = small_map();
        let mut builder = GraphBuilder::new(&map, RobustPolicy::default());
        builder.set_robust(false);
        builder.add_keyframe(KeyFrameId::new(1), false);
        let object = MapObjectId::new(0);
        assert!(!builder.add_object_detection(KeyFrameId::new(0), object));
        assert!(builder.add_object_detection(KeyFrameId::new(1), object));
        assert!(!builder.add_object_shape_detection(KeyFrameId::new(1), object));
        let ell = builder.add_object(object).unwrap();
        assert!(builder.ids().objects.contains(ell));
        assert!(builder.add_object_shape_detection(KeyFrameId::new(1), object));

        let graph = builder.finish();
        assert!(graph.edges.iter().all(|(_, e)| e.robust_delta.is_none()));
        let mut engine = LevenbergMarquardt::default();
        let loaded = graph.load_into(&mut engine);
        assert_eq!(loaded.len(), 2);
        assert_eq!(engine.num_vertices(), 2);
    }
}
