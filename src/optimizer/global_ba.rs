//! Global Bundle Adjustment.
//!
//! Refines every keyframe pose, map point, and plane of the map at once.
//! Loop closing runs it in the background after the essential graph has been
//! corrected; in that case the results are staged on the entities (`*_gba`
//! fields) and applied by the caller, since the map may have grown meanwhile.
//!
//! The work is split into three phases so that the map lock is only held
//! while reading the snapshot and while writing results back:
//! 1. [`collect_global_ba_data`] builds the graph under the read lock
//! 2. [`solve_global_ba`] runs the engine without any lock
//! 3. [`apply_global_ba_results`] writes back under the write lock

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map, MapPlaneId, MapPointId};
use crate::atlas::{SharedMap, StopFlag};
use crate::config::PlaneSettings;
use crate::geometry::{Plane3, SE3};

use super::engine::OptimizationEngine;
use super::graph_builder::{Graph, GraphBuilder};
use super::lm::{LevenbergMarquardt, LevenbergMarquardtConfig};
use super::robust::RobustPolicy;

/// Configuration for Global Bundle Adjustment.
#[derive(Debug, Clone)]
pub struct GlobalBAConfig {
    /// Maximum number of LM iterations.
    pub iterations: usize,

    /// Attach Huber kernels to reprojection edges. Plane edges are always
    /// robustified.
    pub robust: bool,

    /// Loop keyframe that triggered the run. When set, results are staged
    /// instead of written into the live estimates.
    pub loop_kf: Option<KeyFrameId>,

    pub plane: PlaneSettings,

    pub solver: LevenbergMarquardtConfig,
}

impl Default for GlobalBAConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            robust: true,
            loop_kf: None,
            plane: PlaneSettings::default(),
            solver: LevenbergMarquardtConfig::default(),
        }
    }
}

/// Snapshot of the whole map as an optimization problem.
pub struct GlobalBAProblemData {
    pub graph: Graph,

    /// Keyframes with a pose vertex, ascending.
    pub kf_ids: Vec<KeyFrameId>,

    /// Points that kept at least one edge.
    pub mp_ids: Vec<MapPointId>,

    /// Seen and not-seen planes that kept at least one edge.
    pub plane_ids: Vec<MapPlaneId>,

    /// Largest keyframe id at snapshot time.
    pub max_kf_id: KeyFrameId,
}

/// Result of Global BA.
#[derive(Debug, Clone)]
pub struct GlobalBAResult {
    /// Optimized keyframe poses (T_cw).
    pub optimized_poses: HashMap<KeyFrameId, SE3>,

    /// Optimized map point positions.
    pub optimized_points: HashMap<MapPointId, Vector3<f64>>,

    /// Optimized world-frame planes.
    pub optimized_planes: HashMap<MapPlaneId, Plane3>,

    pub max_kf_id: KeyFrameId,

    /// Number of iterations.
    pub iterations: usize,

    /// Initial robust χ².
    pub initial_error: f64,

    /// Final robust χ².
    pub final_error: f64,
}

/// PHASE 1: Collect the graph for Global BA.
pub fn collect_global_ba_data(map: &Map, config: &GlobalBAConfig) -> Option<GlobalBAProblemData> {
    let max_kf_id = map.max_keyframe_id()?;
    let mut builder = GraphBuilder::new(map, RobustPolicy::new(config.plane));

    let mut kf_ids = Vec::new();
    for kf_id in map.sorted_keyframe_ids() {
        if builder.add_keyframe(kf_id, false).is_some() {
            kf_ids.push(kf_id);
        }
    }
    if kf_ids.is_empty() {
        return None;
    }

    builder.set_robust(config.robust);
    let mut mp_ids = Vec::new();
    for mp_id in map.sorted_map_point_ids() {
        let Some(vertex) = builder.add_point(mp_id) else {
            continue;
        };
        if builder.add_point_observations(mp_id) == 0 {
            builder.remove_vertex(vertex);
        } else {
            mp_ids.push(mp_id);
        }
    }

    builder.set_robust(true);
    let registries: Vec<MapPlaneId> = map
        .seen_plane_ids()
        .chain(map.not_seen_plane_ids())
        .copied()
        .collect();
    let mut plane_ids = Vec::new();
    for plane_id in registries {
        let Some(vertex) = builder.add_plane(plane_id) else {
            continue;
        };
        if builder.add_plane_observations(plane_id) == 0 {
            builder.remove_vertex(vertex);
        } else {
            plane_ids.push(plane_id);
        }
    }

    if builder.num_edges() == 0 {
        return None;
    }

    Some(GlobalBAProblemData {
        graph: builder.finish(),
        kf_ids,
        mp_ids,
        plane_ids,
        max_kf_id,
    })
}

/// PHASE 2: Solve Global BA.
pub fn solve_global_ba(
    problem: GlobalBAProblemData,
    config: &GlobalBAConfig,
    stop: Option<StopFlag>,
) -> Option<GlobalBAResult> {
    let ids = problem.graph.ids;
    let mut engine = LevenbergMarquardt::new(config.solver);
    let edges = problem.graph.load_into(&mut engine);
    if let Some(flag) = stop {
        engine.set_stop_flag(flag);
    }
    if !engine.initialize_optimization(0) {
        return None;
    }

    let initial_error = engine.active_chi2();
    let iterations = engine.optimize(config.iterations);
    let final_error = engine.active_chi2();
    debug!(
        "Global BA graph: {} vertices, {} edges",
        engine.num_vertices(),
        edges.len()
    );

    let optimized_poses = problem
        .kf_ids
        .iter()
        .filter_map(|&kf_id| {
            let pose = engine.vertex(ids.keyframe(kf_id)?)?.estimate.as_pose()?;
            Some((kf_id, *pose))
        })
        .collect();
    let optimized_points = problem
        .mp_ids
        .iter()
        .filter_map(|&mp_id| {
            let p = engine.vertex(ids.point(mp_id)?)?.estimate.as_point()?;
            Some((mp_id, *p))
        })
        .collect();
    // Planes sit in either plane range; look in both.
    let optimized_planes = problem
        .plane_ids
        .iter()
        .filter_map(|&plane_id| {
            [true, false].iter().find_map(|&seen| {
                let plane = engine.vertex(ids.plane(plane_id, seen)?)?.estimate.as_plane()?;
                Some((plane_id, *plane))
            })
        })
        .collect();

    Some(GlobalBAResult {
        optimized_poses,
        optimized_points,
        optimized_planes,
        max_kf_id: problem.max_kf_id,
        iterations,
        initial_error,
        final_error,
    })
}

/// PHASE 3: Apply Global BA results.
///
/// Entities that turned bad during the solve are skipped. Returns the number
/// of entities written or staged.
pub fn apply_global_ba_results(
    map: &mut Map,
    results: &GlobalBAResult,
    loop_kf: Option<KeyFrameId>,
) -> usize {
    let mut updated = 0;

    for (kf_id, pose) in &results.optimized_poses {
        if *kf_id > results.max_kf_id {
            continue;
        }
        let Some(kf) = map.get_keyframe_mut(*kf_id).filter(|kf| !kf.is_bad) else {
            continue;
        };
        match loop_kf {
            None => kf.pose_cw = *pose,
            Some(loop_id) => {
                kf.pose_gba = Some(*pose);
                kf.ba_global_for_kf = Some(loop_id);
            }
        }
        updated += 1;
    }

    for (mp_id, position) in &results.optimized_points {
        let Some(mp) = map.get_map_point_mut(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        match loop_kf {
            None => mp.position = *position,
            Some(loop_id) => {
                mp.position_gba = Some(*position);
                mp.ba_global_for_kf = Some(loop_id);
            }
        }
        if loop_kf.is_none() {
            map.update_map_point_normal_and_depth(*mp_id);
        }
        updated += 1;
    }

    for (plane_id, plane) in &results.optimized_planes {
        let Some(map_plane) = map.get_map_plane_mut(*plane_id).filter(|p| !p.is_bad) else {
            continue;
        };
        match loop_kf {
            None => map_plane.plane = *plane,
            Some(loop_id) => {
                map_plane.plane_gba = Some(*plane);
                map_plane.ba_global_for_kf = Some(loop_id);
            }
        }
        updated += 1;
    }

    if loop_kf.is_none() {
        map.inform_new_big_change();
    }
    updated
}

/// Run Global BA over the whole map.
///
/// Returns `None` when there is nothing to optimize. A raised stop flag
/// shortens the solve; whatever was reached is still applied.
pub fn global_bundle_adjustment(
    shared: &SharedMap,
    config: &GlobalBAConfig,
    stop: Option<StopFlag>,
) -> Option<GlobalBAResult> {
    // Phase 1: Collect
    let problem = {
        let map = shared.read();
        collect_global_ba_data(&map, config)
    };
    let Some(problem) = problem else {
        debug!("Global BA skipped: nothing to optimize");
        return None;
    };
    let (n_kfs, n_mps, n_planes) = (
        problem.kf_ids.len(),
        problem.mp_ids.len(),
        problem.plane_ids.len(),
    );

    // Phase 2: Solve
    let result = solve_global_ba(problem, config, stop)?;

    // Phase 3: Apply
    let updated = {
        let mut map = shared.write();
        apply_global_ba_results(&mut map, &result, config.loop_kf)
    };

    info!(
        "Global BA complete: {} KFs, {} MPs, {} planes, {} iterations, error {:.4} -> {:.4}, {} updated{}",
        n_kfs,
        n_mps,
        n_planes,
        result.iterations,
        result.initial_error,
        result.final_error,
        updated,
        if config.loop_kf.is_some() { " (staged)" } else { "" }
    );
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::MapPoint;
    use crate::optimizer::test_scene::{Scene, SceneConfig};
    use crate::optimizer::graph_builder::EdgeTag;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_global_ba_config_default() {
        let config = GlobalBAConfig::default();
        assert_eq!(config.iterations, 10);
        assert!(config.robust);
        assert!(config.loop_kf.is_none());
    }

    #[test]
    fn test_recovers_perturbed_scene() {
        let mut scene = Scene::new(SceneConfig::default());
        scene.perturb(11, 0.02, 0.05);
        let origin = scene.map.get_keyframe(KeyFrameId::new(0)).unwrap().pose_cw;
        let before = scene.mean_point_error(&scene.map);

        let shared = SharedMap::new(std::mem::take(&mut scene.map));
        let config = GlobalBAConfig {
            iterations: 20,
            ..Default::default()
        };
        let result = global_bundle_adjustment(&shared, &config, None).unwrap();
        assert!(result.final_error < result.initial_error);

        let map = shared.read();
        assert_eq!(map.get_keyframe(KeyFrameId::new(0)).unwrap().pose_cw, origin);
        for i in 1..scene.true_poses.len() {
            assert!(scene.pose_error(&map, i) < 1e-3, "KF{} off", i);
        }
        assert!(scene.mean_point_error(&map) < before * 0.05);
        assert_eq!(map.last_big_change_idx(), 1);
    }

    #[test]
    fn test_loop_mode_stages_results() {
        let mut scene = Scene::new(SceneConfig::default());
        scene.perturb(5, 0.02, 0.05);
        let pose_before = scene.map.get_keyframe(KeyFrameId::new(3)).unwrap().pose_cw;
        let shared = SharedMap::new(std::mem::take(&mut scene.map));

        let loop_kf = KeyFrameId::new(4);
        let config = GlobalBAConfig {
            loop_kf: Some(loop_kf),
            ..Default::default()
        };
        global_bundle_adjustment(&shared, &config, None).unwrap();

        let map = shared.read();
        let kf = map.get_keyframe(KeyFrameId::new(3)).unwrap();
        assert_eq!(kf.pose_cw, pose_before);
        assert!(kf.pose_gba.is_some());
        assert_eq!(kf.ba_global_for_kf, Some(loop_kf));
        let mp = map.get_map_point(MapPointId::new(0)).unwrap();
        assert!(mp.position_gba.is_some());
        assert_eq!(mp.ba_global_for_kf, Some(loop_kf));
        let plane = map.get_map_plane(MapPlaneId::new(2)).unwrap();
        assert_eq!(plane.ba_global_for_kf, Some(loop_kf));
        assert_eq!(map.last_big_change_idx(), 0);
    }

    #[test]
    fn test_unobserved_points_are_excluded() {
        let mut scene = Scene::new(SceneConfig::default());
        let lonely = MapPointId::new(1000);
        scene
            .map
            .add_map_point(MapPoint::new(lonely, Vector3::new(0.0, 0.0, 5.0), KeyFrameId::new(0)));

        let problem = collect_global_ba_data(&scene.map, &GlobalBAConfig::default()).unwrap();
        assert!(!problem.mp_ids.contains(&lonely));
        let vertex = problem.graph.ids.point(lonely).unwrap();
        assert!(problem.graph.vertices.iter().all(|v| v.id != vertex));
    }

    #[test]
    fn test_points_robust_only_on_request_planes_always() {
        let scene = Scene::new(SceneConfig::default());
        let config = GlobalBAConfig {
            robust: false,
            ..Default::default()
        };
        let problem = collect_global_ba_data(&scene.map, &config).unwrap();
        let mut saw_plane = false;
        for (tag, edge) in &problem.graph.edges {
            match tag {
                EdgeTag::Point { .. } => assert!(edge.robust_delta.is_none()),
                EdgeTag::Plane { .. } => {
                    saw_plane = true;
                    assert!(edge.robust_delta.is_some());
                }
                EdgeTag::Object { .. } => {}
            }
        }
        assert!(saw_plane);
    }

    #[test]
    fn test_bad_keyframes_are_left_out() {
        let mut scene = Scene::new(SceneConfig::default());
        scene.map.erase_keyframe(KeyFrameId::new(2));
        let problem = collect_global_ba_data(&scene.map, &GlobalBAConfig::default()).unwrap();
        assert!(!problem.kf_ids.contains(&KeyFrameId::new(2)));
        assert_eq!(problem.kf_ids.len(), 4);
    }

    #[test]
    fn test_stop_flag_and_empty_map() {
        let scene = Scene::new(SceneConfig::default());
        let shared = SharedMap::new(scene.map);
        let stop = Arc::new(AtomicBool::new(true));
        let result =
            global_bundle_adjustment(&shared, &GlobalBAConfig::default(), Some(stop)).unwrap();
        assert_eq!(result.iterations, 0);

        let empty = SharedMap::new(Map::new());
        assert!(global_bundle_adjustment(&empty, &GlobalBAConfig::default(), None).is_none());
    }
}
