//! Essential graph optimization for loop closing.
//!
//! Every keyframe becomes a similarity vertex; the loop keyframe is the
//! anchor. Edges come from the new loop connections, the spanning tree, the
//! stored loop edges, and strong covisibility. After the solve each keyframe
//! gets its rigid pose back (`[R | t/s]`) and every map point is carried along
//! with its reference keyframe.
//!
//! Same three phases as Global BA:
//! 1. [`collect_essential_graph_data`] under the read lock
//! 2. [`solve_essential_graph`] without any lock
//! 3. [`apply_essential_graph_results`] under the write lock

use std::collections::{HashMap, HashSet};

use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map};
use crate::atlas::SharedMap;
use crate::geometry::Sim3;

use super::engine::{Edge, OptimizationEngine};
use super::factors::{Factor, Vertex, VertexEstimate};
use super::graph_builder::IdAllocator;
use super::lm::{LevenbergMarquardt, LevenbergMarquardtConfig};

/// Keyframe → similarity `S_cw`, as produced by loop correction.
pub type KeyFrameAndPose = HashMap<KeyFrameId, Sim3>;

/// Configuration for the essential graph optimization.
#[derive(Debug, Clone)]
pub struct EssentialGraphConfig {
    /// Freeze the scale of every vertex (stereo and RGB-D).
    pub fix_scale: bool,

    /// Minimum covisibility weight for covisibility edges and for loop
    /// connections other than the current/loop pair.
    pub min_feat: usize,

    pub iterations: usize,

    pub solver: LevenbergMarquardtConfig,
}

impl Default for EssentialGraphConfig {
    fn default() -> Self {
        Self {
            fix_scale: false,
            min_feat: 100,
            iterations: 20,
            solver: LevenbergMarquardtConfig {
                initial_lambda: Some(1e-16),
                ..LevenbergMarquardtConfig::default()
            },
        }
    }
}

/// Why an edge was added to the essential graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssentialEdgeKind {
    LoopConnection,
    SpanningTree,
    LoopEdge,
    Covisibility,
}

pub struct EssentialGraphProblemData {
    pub ids: IdAllocator,
    pub vertices: Vec<Vertex>,
    pub edges: Vec<(EssentialEdgeKind, Edge)>,
    pub kf_ids: Vec<KeyFrameId>,
    /// Seed similarity of every keyframe, used again to move map points.
    pub seeds: KeyFrameAndPose,
}

pub struct EssentialGraphResult {
    pub optimized: KeyFrameAndPose,
    pub seeds: KeyFrameAndPose,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub num_edges: usize,
}

fn relative(s_jw: &Sim3, s_iw: &Sim3) -> Sim3 {
    s_jw.compose(&s_iw.inverse())
}

fn pair(a: KeyFrameId, b: KeyFrameId) -> (KeyFrameId, KeyFrameId) {
    (a.min(b), a.max(b))
}

/// PHASE 1: Collect the essential graph from the map.
pub fn collect_essential_graph_data(
    map: &Map,
    loop_kf: KeyFrameId,
    current_kf: KeyFrameId,
    non_corrected: &KeyFrameAndPose,
    corrected: &KeyFrameAndPose,
    loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    config: &EssentialGraphConfig,
) -> Option<EssentialGraphProblemData> {
    let ids = IdAllocator::new(map.max_keyframe_id().map(|id| id.0), None, None, None);
    let kf_ids: Vec<KeyFrameId> = map
        .sorted_keyframe_ids()
        .into_iter()
        .filter(|&id| map.get_keyframe(id).is_some_and(|kf| !kf.is_bad))
        .collect();
    if kf_ids.is_empty() {
        return None;
    }

    let mut vertices = Vec::with_capacity(kf_ids.len());
    let mut seeds = KeyFrameAndPose::new();
    for &kf_id in &kf_ids {
        let (Some(kf), Some(vertex)) = (map.get_keyframe(kf_id), ids.keyframe(kf_id)) else {
            continue;
        };
        let seed = corrected
            .get(&kf_id)
            .copied()
            .unwrap_or_else(|| Sim3::from_se3(&kf.pose_cw));
        vertices.push(
            Vertex::new(
                vertex,
                VertexEstimate::Sim3 {
                    value: seed,
                    fix_scale: config.fix_scale,
                },
            )
            .fixed(kf_id == loop_kf),
        );
        seeds.insert(kf_id, seed);
    }

    let information = DMatrix::<f64>::identity(7, 7);
    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let mut push_edge = |kind, i: KeyFrameId, j: KeyFrameId, s_ji: Sim3| {
        if let (Some(from), Some(to)) = (ids.keyframe(i), ids.keyframe(j)) {
            let factor = Factor::Sim3Relative {
                from,
                to,
                measurement: s_ji,
            };
            edges.push((kind, Edge::new(factor, information.clone())));
        }
    };

    // New loop connections, seeded transforms on both sides.
    let mut sources: Vec<&KeyFrameId> = loop_connections.keys().collect();
    sources.sort();
    for &i in sources {
        let (Some(kf), Some(s_iw)) = (map.get_keyframe(i), seeds.get(&i)) else {
            continue;
        };
        let mut connected: Vec<KeyFrameId> = loop_connections[&i].iter().copied().collect();
        connected.sort();
        for j in connected {
            let primary = i == current_kf && j == loop_kf;
            if !primary && kf.get_covisibility_weight(j) < config.min_feat {
                continue;
            }
            let Some(s_jw) = seeds.get(&j) else {
                continue;
            };
            push_edge(EssentialEdgeKind::LoopConnection, i, j, relative(s_jw, s_iw));
            inserted.insert(pair(i, j));
        }
    }

    // Uncorrected poses where available, so corrected keyframes chain with
    // the rest.
    let uncorrected = |id: KeyFrameId| non_corrected.get(&id).or_else(|| seeds.get(&id));

    for &i in &kf_ids {
        let Some(kf) = map.get_keyframe(i) else {
            continue;
        };
        let Some(s_iw) = uncorrected(i) else {
            continue;
        };

        if let Some(parent) = kf.parent_id {
            if let Some(s_jw) = uncorrected(parent) {
                push_edge(EssentialEdgeKind::SpanningTree, i, parent, relative(s_jw, s_iw));
            }
        }

        let mut loop_edges: Vec<KeyFrameId> =
            kf.loop_edges.iter().copied().filter(|&l| l < i).collect();
        loop_edges.sort();
        for l in loop_edges {
            if let Some(s_lw) = uncorrected(l) {
                push_edge(EssentialEdgeKind::LoopEdge, i, l, relative(s_lw, s_iw));
            }
        }

        for n in kf.get_covisibles_above_weight(config.min_feat) {
            if Some(n) == kf.parent_id
                || kf.children_ids.contains(&n)
                || kf.loop_edges.contains(&n)
            {
                continue;
            }
            if n >= i || map.get_keyframe(n).map_or(true, |kf| kf.is_bad) {
                continue;
            }
            if !inserted.insert(pair(i, n)) {
                continue;
            }
            if let Some(s_nw) = uncorrected(n) {
                push_edge(EssentialEdgeKind::Covisibility, i, n, relative(s_nw, s_iw));
            }
        }
    }

    Some(EssentialGraphProblemData {
        ids,
        vertices,
        edges,
        kf_ids,
        seeds,
    })
}

/// PHASE 2: Solve the essential graph.
pub fn solve_essential_graph(
    problem: EssentialGraphProblemData,
    config: &EssentialGraphConfig,
) -> Option<EssentialGraphResult> {
    let ids = problem.ids;
    let mut engine = LevenbergMarquardt::new(config.solver);
    for vertex in problem.vertices {
        engine.add_vertex(vertex);
    }
    let mut num_edges = 0;
    for (kind, edge) in problem.edges {
        if engine.add_edge(edge).is_some() {
            num_edges += 1;
        } else {
            debug!("Essential graph: dropped {:?} edge", kind);
        }
    }
    if !engine.initialize_optimization(0) {
        return None;
    }

    let initial_error = engine.active_chi2();
    let iterations = engine.optimize(config.iterations);
    let final_error = engine.active_chi2();

    let optimized = problem
        .kf_ids
        .iter()
        .filter_map(|&kf_id| {
            let sim3 = engine.vertex(ids.keyframe(kf_id)?)?.estimate.as_sim3()?;
            Some((kf_id, *sim3))
        })
        .collect();

    Some(EssentialGraphResult {
        optimized,
        seeds: problem.seeds,
        iterations,
        initial_error,
        final_error,
        num_edges,
    })
}

/// PHASE 3: Write corrected poses and move map points with their reference
/// keyframe. Returns the number of corrected points.
pub fn apply_essential_graph_results(
    map: &mut Map,
    results: &EssentialGraphResult,
    current_kf: KeyFrameId,
) -> usize {
    for (kf_id, s_iw) in &results.optimized {
        if let Some(kf) = map.get_keyframe_mut(*kf_id).filter(|kf| !kf.is_bad) {
            kf.pose_cw = s_iw.to_se3_unscaled();
        }
    }

    let mut corrected_points = 0;
    for mp_id in map.sorted_map_point_ids() {
        let Some(mp) = map.get_map_point_mut(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let reference = match (mp.corrected_by_kf, mp.corrected_reference) {
            (Some(kf), Some(reference)) if kf == current_kf => reference,
            _ => mp.reference_kf,
        };
        let (Some(s_rw), Some(corrected_s_rw)) = (
            results.seeds.get(&reference),
            results.optimized.get(&reference),
        ) else {
            continue;
        };
        let in_reference = s_rw.transform_point(&mp.position);
        mp.position = corrected_s_rw.inverse().transform_point(&in_reference);
        mp.corrected_by_kf = Some(current_kf);
        mp.corrected_reference = Some(reference);
        map.update_map_point_normal_and_depth(mp_id);
        corrected_points += 1;
    }

    map.inform_new_big_change();
    corrected_points
}

/// Optimize the essential graph after a loop was detected between
/// `current_kf` and `loop_kf`.
///
/// `corrected` holds the loop-corrected similarities of the current keyframe's
/// neighbourhood, `non_corrected` their poses before correction.
pub fn optimize_essential_graph(
    shared: &SharedMap,
    loop_kf: KeyFrameId,
    current_kf: KeyFrameId,
    non_corrected: &KeyFrameAndPose,
    corrected: &KeyFrameAndPose,
    loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    config: &EssentialGraphConfig,
) -> Option<EssentialGraphResult> {
    // Phase 1: Collect
    let problem = {
        let map = shared.read();
        collect_essential_graph_data(
            &map,
            loop_kf,
            current_kf,
            non_corrected,
            corrected,
            loop_connections,
            config,
        )
    }?;
    let n_kfs = problem.kf_ids.len();

    // Phase 2: Solve
    let result = solve_essential_graph(problem, config)?;

    // Phase 3: Apply
    let corrected_points = {
        let mut map = shared.write();
        apply_essential_graph_results(&mut map, &result, current_kf)
    };

    info!(
        "Essential graph complete: {} KFs, {} edges, {} iterations, error {:.4} -> {:.4}, {} MPs corrected",
        n_kfs,
        result.num_edges,
        result.iterations,
        result.initial_error,
        result.final_error,
        corrected_points
    );

    Some(result)
}
