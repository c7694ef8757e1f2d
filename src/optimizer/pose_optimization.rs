//! Pose-only optimization of a tracked frame.
//!
//! Map points and planes are held fixed; only the frame's pose moves. Each
//! correspondence is reclassified after every round, so a match flagged as an
//! outlier in one round can come back in the next one. Every round restarts
//! from the frame's input pose.

use tracing::{debug, info};

use crate::atlas::map::{Map, MapPlaneId, PlaneRelation};
use crate::atlas::SharedMap;
use crate::config::PlaneSettings;
use crate::tracking::Frame;

use super::engine::{Edge, EdgeId, OptimizationEngine};
use super::factors::{Vertex, VertexEstimate};
use super::graph_builder::{observed_plane, point_edge, IdAllocator, PlaneFactorParams};
use super::lm::{LevenbergMarquardt, LevenbergMarquardtConfig};
use super::robust::{FactorKind, RobustPolicy};

/// Configuration for frame pose optimization.
#[derive(Debug, Clone)]
pub struct PoseOptimizationConfig {
    /// Optimize-then-classify rounds.
    pub rounds: usize,
    pub iterations_per_round: usize,
    /// Round from which robust kernels are dropped.
    pub robust_rounds: usize,
    /// Stop early once fewer edges than this remain active.
    pub min_active_edges: usize,
    pub plane: PlaneSettings,
    pub solver: LevenbergMarquardtConfig,
}

impl Default for PoseOptimizationConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            iterations_per_round: 10,
            robust_rounds: 2,
            min_active_edges: 10,
            plane: PlaneSettings::default(),
            solver: LevenbergMarquardtConfig::default(),
        }
    }
}

/// Which frame slot an edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Correspondence {
    Point(usize),
    Plane(PlaneRelation, usize),
}

/// Information scale of a plane edge given whether the landmark was ever
/// directly seen.
fn seen_weight(relation: PlaneRelation, plane_seen: bool) -> f64 {
    match (relation, plane_seen) {
        (PlaneRelation::Seen, false) => 2.0,
        (PlaneRelation::NotSeen, false) => 0.5,
        _ => 1.0,
    }
}

fn plane_slots(frame: &Frame, relation: PlaneRelation) -> &[Option<MapPlaneId>] {
    match relation {
        PlaneRelation::Seen => &frame.map_plane_ids,
        PlaneRelation::NotSeen => &frame.not_seen_plane_ids,
        PlaneRelation::Parallel => &frame.parallel_plane_ids,
        PlaneRelation::Vertical => &frame.vertical_plane_ids,
    }
}

fn set_outlier(frame: &mut Frame, correspondence: Correspondence, outlier: bool) {
    let slot = match correspondence {
        Correspondence::Point(idx) => frame.outliers.get_mut(idx),
        Correspondence::Plane(relation, idx) => match relation {
            PlaneRelation::Seen => frame.plane_outliers.get_mut(idx),
            PlaneRelation::NotSeen => frame.not_seen_plane_outliers.get_mut(idx),
            PlaneRelation::Parallel => frame.parallel_plane_outliers.get_mut(idx),
            PlaneRelation::Vertical => frame.vertical_plane_outliers.get_mut(idx),
        },
    };
    if let Some(flag) = slot {
        *flag = outlier;
    }
}

/// Fixed landmark vertices and their edges against the pose vertex.
struct PoseProblem {
    vertices: Vec<Vertex>,
    edges: Vec<(Correspondence, FactorKind, Edge)>,
    num_points: usize,
}

fn collect_pose_problem(
    frame: &Frame,
    map: &Map,
    policy: &RobustPolicy,
    ids: &IdAllocator,
    pose: usize,
) -> PoseProblem {
    let mut vertices = Vec::new();
    let mut edges = Vec::new();
    let mut num_points = 0;

    for (idx, mp_id) in frame.map_point_ids.iter().enumerate() {
        let Some(mp_id) = mp_id else {
            continue;
        };
        let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let (Some(vertex), Some(keypoint)) = (ids.point(*mp_id), frame.keypoints.get(idx)) else {
            continue;
        };
        vertices.push(Vertex::new(vertex, VertexEstimate::Point(mp.position)).fixed(true));
        let u_right = frame.u_right.get(idx).copied().unwrap_or(-1.0);
        let (kind, edge) = point_edge(
            policy,
            &frame.camera,
            &frame.pyramid,
            pose,
            vertex,
            keypoint,
            u_right,
            true,
        );
        edges.push((Correspondence::Point(idx), kind, edge));
        num_points += 1;
    }

    for relation in PlaneRelation::ALL {
        for (idx, plane_id) in plane_slots(frame, relation).iter().enumerate() {
            let Some(plane_id) = plane_id else {
                continue;
            };
            let Some(plane) = map.get_map_plane(*plane_id).filter(|p| !p.is_bad) else {
                continue;
            };
            let Some(vertex) = ids.plane_for_relation(relation, *plane_id) else {
                continue;
            };
            let Some(measurement) = observed_plane(
                &frame.plane_coefficients,
                &frame.not_seen_plane_coefficients,
                relation,
                idx,
            ) else {
                continue;
            };
            vertices.push(Vertex::new(vertex, VertexEstimate::Plane(plane.plane)).fixed(true));
            let params = PlaneFactorParams::new(policy, relation)
                .with_information_scale(seen_weight(relation, plane.seen));
            let edge = params.edge(policy, pose, vertex, measurement, true);
            edges.push((Correspondence::Plane(relation, idx), relation.into(), edge));
        }
    }

    PoseProblem {
        vertices,
        edges,
        num_points,
    }
}

/// Refine `frame.pose_cw` against its matched points and planes.
///
/// Fills the frame's outlier flags and returns the number of inlier
/// correspondences. Fewer than 3 point matches leave the frame untouched and
/// return 0.
pub fn pose_optimization(
    frame: &mut Frame,
    shared: &SharedMap,
    config: &PoseOptimizationConfig,
) -> usize {
    let policy = RobustPolicy::new(config.plane);

    let (ids, problem) = {
        let map = shared.read();
        let ids = IdAllocator::new(
            Some(0),
            map.max_map_point_id().map(|id| id.0),
            map.max_map_plane_id().map(|id| id.0),
            None,
        );
        let problem = collect_pose_problem(frame, &map, &policy, &ids, ids.keyframes.start);
        (ids, problem)
    };

    if problem.num_points < 3 {
        debug!(
            "[PoseOpt] frame {}: only {} point correspondences",
            frame.id, problem.num_points
        );
        return 0;
    }

    let pose = ids.keyframes.start;
    let mut engine = LevenbergMarquardt::new(config.solver);
    engine.add_vertex(Vertex::new(pose, VertexEstimate::Pose(frame.pose_cw)));
    for vertex in problem.vertices {
        engine.add_vertex(vertex);
    }
    let mut edges: Vec<(Correspondence, FactorKind, EdgeId)> = Vec::new();
    for (correspondence, kind, edge) in problem.edges {
        set_outlier(frame, correspondence, false);
        if let Some(id) = engine.add_edge(edge) {
            edges.push((correspondence, kind, id));
        }
    }
    let n_initial = edges.len();

    let mut n_bad = 0;
    for round in 0..config.rounds {
        engine.set_estimate(pose, VertexEstimate::Pose(frame.pose_cw));
        if !engine.initialize_optimization(0) {
            break;
        }
        engine.optimize(config.iterations_per_round);

        n_bad = 0;
        for &(correspondence, kind, id) in &edges {
            let chi2 = engine.edge_chi2(id).unwrap_or(f64::INFINITY);
            let outlier = policy.is_outlier(kind, chi2);
            set_outlier(frame, correspondence, outlier);
            engine.set_edge_level(id, usize::from(outlier));
            if outlier {
                n_bad += 1;
            }
            if round == config.robust_rounds {
                engine.set_robust_kernel(id, None);
            }
        }
        debug!(
            "[PoseOpt] frame {} round {}: {} of {} outliers",
            frame.id, round, n_bad, n_initial
        );

        if n_initial - n_bad < config.min_active_edges {
            break;
        }
    }

    if let Some(optimized) = engine.vertex(pose).and_then(|v| v.estimate.as_pose()) {
        frame.pose_cw = *optimized;
    }
    let inliers = n_initial - n_bad;
    info!(
        "[PoseOpt] frame {}: {}/{} inliers, camera at {:?}",
        frame.id,
        inliers,
        n_initial,
        frame.pose_cw.camera_center().as_slice()
    );
    inliers
}
