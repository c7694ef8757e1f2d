//! Two-view similarity refinement.
//!
//! Refines the similarity `S12` between two keyframes from matched map
//! points. Each match contributes two reprojection edges, one into each
//! camera; the points themselves stay fixed, expressed in their own camera.

use nalgebra::{DMatrix, Vector3};
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::SharedMap;
use crate::geometry::Sim3;

use super::engine::{Edge, EdgeId, OptimizationEngine};
use super::factors::{Factor, Vertex, VertexEstimate, VertexId};
use super::lm::{LevenbergMarquardt, LevenbergMarquardtConfig};

/// Configuration for two-view similarity refinement.
#[derive(Debug, Clone)]
pub struct Sim3RefineConfig {
    /// Hold the scale at its initial value (stereo and RGB-D).
    pub fix_scale: bool,
    pub initial_iterations: usize,
    /// Second pass when some matches were rejected.
    pub iterations_after_removal: usize,
    /// Second pass when every match survived.
    pub iterations_without_removal: usize,
    pub min_inliers: usize,
    pub solver: LevenbergMarquardtConfig,
}

impl Default for Sim3RefineConfig {
    fn default() -> Self {
        Self {
            fix_scale: false,
            initial_iterations: 5,
            iterations_after_removal: 10,
            iterations_without_removal: 5,
            min_inliers: 10,
            solver: LevenbergMarquardtConfig::default(),
        }
    }
}

/// One usable match, with both points in their own camera frame.
struct Correspondence {
    feature_idx: usize,
    p1: Vector3<f64>,
    p2: Vector3<f64>,
    edge_12: Edge,
    edge_21: Edge,
}

const SIM3_VERTEX: VertexId = 0;

fn exceeds(engine: &LevenbergMarquardt, edge: EdgeId, th2: f64) -> bool {
    engine.edge_chi2(edge).map_or(true, |chi2| chi2 > th2)
}

fn point_vertices(n: usize) -> (VertexId, VertexId) {
    (2 * n + 1, 2 * n + 2)
}

fn collect_sim3_problem(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    matches: &[Option<MapPointId>],
    th2: f64,
) -> Option<Vec<Correspondence>> {
    let kf1 = map.get_keyframe(kf1_id)?;
    let kf2 = map.get_keyframe(kf2_id)?;

    let mut correspondences = Vec::new();
    for (i, matched) in matches.iter().enumerate() {
        let Some(mp2_id) = matched else {
            continue;
        };
        let Some(mp1_id) = kf1.get_map_point(i) else {
            continue;
        };
        let (Some(mp1), Some(mp2)) = (map.get_map_point(mp1_id), map.get_map_point(*mp2_id)) else {
            continue;
        };
        if mp1.is_bad || mp2.is_bad {
            continue;
        }
        let Some(i2) = mp2.index_in_keyframe(kf2_id) else {
            continue;
        };
        let (Some(kp1), Some(kp2)) = (kf1.keypoints.get(i), kf2.keypoints.get(i2)) else {
            continue;
        };

        let (v1, v2) = point_vertices(correspondences.len());
        let delta = th2.sqrt();
        let edge_12 = Edge::new(
            Factor::Sim3Projection {
                sim3: SIM3_VERTEX,
                point: v2,
                measurement: kp1.pt,
                camera: kf1.camera,
            },
            DMatrix::identity(2, 2) * kf1.pyramid.inv_sigma2(kp1.octave),
        )
        .with_huber(delta);
        let edge_21 = Edge::new(
            Factor::Sim3InverseProjection {
                sim3: SIM3_VERTEX,
                point: v1,
                measurement: kp2.pt,
                camera: kf2.camera,
            },
            DMatrix::identity(2, 2) * kf2.pyramid.inv_sigma2(kp2.octave),
        )
        .with_huber(delta);

        correspondences.push(Correspondence {
            feature_idx: i,
            p1: kf1.pose_cw.transform_point(&mp1.position),
            p2: kf2.pose_cw.transform_point(&mp2.position),
            edge_12,
            edge_21,
        });
    }

    Some(correspondences)
}

/// Refine `s12` from the matches of `kf1` (`matches[i]` is the point of `kf2`
/// matched to feature `i` of `kf1`).
///
/// Matches whose reprojection χ² exceeds `th2` in either direction are cleared
/// from `matches`. Returns the number of inliers, or 0 when fewer than
/// `min_inliers` survive the first pass; `s12` is then left as it was.
pub fn optimize_sim3(
    shared: &SharedMap,
    kf1: KeyFrameId,
    kf2: KeyFrameId,
    matches: &mut [Option<MapPointId>],
    s12: &mut Sim3,
    th2: f64,
    config: &Sim3RefineConfig,
) -> usize {
    let correspondences = {
        let map = shared.read();
        collect_sim3_problem(&map, kf1, kf2, matches, th2)
    };
    let Some(correspondences) = correspondences else {
        return 0;
    };

    let mut engine = LevenbergMarquardt::new(config.solver);
    engine.add_vertex(Vertex::new(
        SIM3_VERTEX,
        VertexEstimate::Sim3 {
            value: *s12,
            fix_scale: config.fix_scale,
        },
    ));
    let mut edges: Vec<(usize, EdgeId, EdgeId)> = Vec::new();
    for (n, c) in correspondences.into_iter().enumerate() {
        let (v1, v2) = point_vertices(n);
        engine.add_vertex(Vertex::new(v1, VertexEstimate::Point(c.p1)).fixed(true));
        engine.add_vertex(Vertex::new(v2, VertexEstimate::Point(c.p2)).fixed(true));
        if let (Some(e12), Some(e21)) = (engine.add_edge(c.edge_12), engine.add_edge(c.edge_21)) {
            edges.push((c.feature_idx, e12, e21));
        }
    }
    let n_correspondences = edges.len();

    if engine.initialize_optimization(0) {
        engine.optimize(config.initial_iterations);
    }

    let mut n_bad = 0;
    let mut inliers = Vec::with_capacity(edges.len());
    for (idx, e12, e21) in edges {
        if exceeds(&engine, e12, th2) || exceeds(&engine, e21, th2) {
            engine.remove_edge(e12);
            engine.remove_edge(e21);
            matches[idx] = None;
            n_bad += 1;
        } else {
            inliers.push((idx, e12, e21));
        }
    }
    if n_correspondences - n_bad < config.min_inliers {
        debug!(
            "[Sim3Opt] KF {} -> KF {} rejected: {} of {} matches left",
            kf1.0,
            kf2.0,
            n_correspondences - n_bad,
            n_correspondences
        );
        return 0;
    }

    let more_iterations = if n_bad > 0 {
        config.iterations_after_removal
    } else {
        config.iterations_without_removal
    };
    if engine.initialize_optimization(0) {
        engine.optimize(more_iterations);
    }

    let mut n_in = 0;
    for &(idx, e12, e21) in &inliers {
        if exceeds(&engine, e12, th2) || exceeds(&engine, e21, th2) {
            matches[idx] = None;
        } else {
            n_in += 1;
        }
    }

    if let Some(refined) = engine.vertex(SIM3_VERTEX).and_then(|v| v.estimate.as_sim3()) {
        *s12 = *refined;
    }
    info!(
        "[Sim3Opt] KF {} -> KF {}: {} inliers of {}, scale {:.4}",
        kf1.0, kf2.0, n_in, n_correspondences, s12.scale
    );
    n_in
}
