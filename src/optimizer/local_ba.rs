//! Local Bundle Adjustment.
//!
//! Optimizes the poses of a keyframe and its covisible neighbours together
//! with every point and plane they observe. Keyframes that observe those
//! landmarks from outside the window are added as fixed poses so the window
//! stays anchored to the rest of the map.
//!
//! The run has two passes. After the first, edges above their χ² bound (or
//! whose point falls behind the camera) are switched off and robust kernels
//! are dropped, then the survivors are optimized again. Outlier point and
//! not-seen plane relations are erased from the map during write-back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::atlas::map::{
    KeyFrameId, Map, MapObjectId, MapPlaneId, MapPointId, ObjectTrackId, PlaneRelation,
};
use crate::atlas::{SharedMap, StopFlag};
use crate::config::PlaneSettings;
use crate::geometry::{Ellipsoid, Plane3, SE3};

use super::engine::{EdgeId, OptimizationEngine};
use super::graph_builder::{EdgeTag, Graph, GraphBuilder, IdAllocator};
use super::lm::{LevenbergMarquardt, LevenbergMarquardtConfig};
use super::robust::{FactorKind, RobustPolicy};

/// How object landmarks take part in the adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectMode {
    #[default]
    Disabled,
    /// Detections constrain keyframe poses against the current ellipsoids.
    DetectionOnly,
    /// Ellipsoids are optimized jointly with the poses.
    FullShape,
}

/// Configuration for local BA.
#[derive(Debug, Clone)]
pub struct LocalBAConfig {
    pub object_mode: ObjectMode,
    /// Iterations of the first pass.
    pub first_pass_iterations: usize,
    /// Iterations of the first pass when ellipsoids are optimized.
    pub shape_first_pass_iterations: usize,
    /// Iterations of the second pass, on inliers only.
    pub second_pass_iterations: usize,
    pub plane: PlaneSettings,
    pub solver: LevenbergMarquardtConfig,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            object_mode: ObjectMode::Disabled,
            first_pass_iterations: 5,
            shape_first_pass_iterations: 20,
            second_pass_iterations: 10,
            plane: PlaneSettings::default(),
            solver: LevenbergMarquardtConfig::default(),
        }
    }
}

/// Entities taking part in one local BA run.
#[derive(Debug, Clone, Default)]
pub struct LocalWindow {
    /// The current keyframe first, then its covisibles by weight.
    pub local_kfs: Vec<KeyFrameId>,
    pub fixed_kfs: Vec<KeyFrameId>,
    pub points: Vec<MapPointId>,
    /// Planes matched as seen by a local keyframe.
    pub planes: Vec<MapPlaneId>,
    /// Planes matched as not-seen by a local keyframe, minus those above.
    pub not_seen_planes: Vec<MapPlaneId>,
    pub objects: Vec<MapObjectId>,
}

/// Result of local bundle adjustment.
#[derive(Debug, Clone, Default)]
pub struct LocalBAResult {
    /// Iterations over both passes.
    pub iterations: usize,
    /// Robust χ² before the first pass.
    pub initial_error: f64,
    /// χ² after the last pass.
    pub final_error: f64,
    pub num_local_keyframes: usize,
    pub num_fixed_keyframes: usize,
    pub num_map_points: usize,
    pub num_planes: usize,
    pub num_objects: usize,
    pub num_edges: usize,
    /// False when the stop flag cut the run after the first pass.
    pub refined: bool,
    /// Point observations erased as outliers.
    pub erased_point_observations: usize,
    /// Not-seen plane relations erased as outliers.
    pub erased_plane_observations: usize,
    /// Outlier seen, parallel, and vertical plane relations (kept).
    pub kept_plane_outliers: usize,
}

/// Graph for one run, built under the read lock.
pub struct LocalBAProblemData {
    pub current_kf: KeyFrameId,
    pub window: LocalWindow,
    /// Objects with an ellipsoid vertex, and the track keying it.
    pub object_tracks: Vec<(MapObjectId, ObjectTrackId)>,
    pub graph: Graph,
}

/// Optimized estimates plus the relations to erase.
struct LocalBASolution {
    poses: HashMap<KeyFrameId, SE3>,
    points: HashMap<MapPointId, Vector3<f64>>,
    planes: HashMap<MapPlaneId, Plane3>,
    ellipsoids: HashMap<MapObjectId, Ellipsoid>,
    point_outliers: Vec<(KeyFrameId, MapPointId)>,
    not_seen_outliers: Vec<(KeyFrameId, MapPlaneId)>,
    kept_plane_outliers: usize,
    iterations: usize,
    initial_error: f64,
    final_error: f64,
    refined: bool,
    num_edges: usize,
}

fn stop_requested(stop: &Option<StopFlag>) -> bool {
    stop.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
}

/// Select the local window around `current_kf_id`.
///
/// Returns `None` if the keyframe is unknown or bad.
pub fn select_local_window(
    map: &Map,
    current_kf_id: KeyFrameId,
    objects: bool,
) -> Option<LocalWindow> {
    let current = map.get_keyframe(current_kf_id).filter(|kf| !kf.is_bad)?;
    let mut window = LocalWindow::default();

    // Step 1: Local keyframes (current + covisible)
    let mut local_set: HashSet<KeyFrameId> = HashSet::new();
    local_set.insert(current_kf_id);
    window.local_kfs.push(current_kf_id);
    for neighbor_id in current.ordered_covisibles() {
        let usable = map.get_keyframe(neighbor_id).is_some_and(|kf| !kf.is_bad);
        if usable && local_set.insert(neighbor_id) {
            window.local_kfs.push(neighbor_id);
        }
    }

    // Step 2: Local points and planes seen by local keyframes
    let mut point_set: HashSet<MapPointId> = HashSet::new();
    let mut plane_set: HashSet<MapPlaneId> = HashSet::new();
    for &kf_id in &window.local_kfs {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        for (_, mp_id) in kf.get_map_point_indices() {
            let good = map.get_map_point(mp_id).is_some_and(|mp| !mp.is_bad);
            if good && point_set.insert(mp_id) {
                window.points.push(mp_id);
            }
        }
        for plane_id in kf.map_plane_ids.iter().flatten() {
            let good = map.get_map_plane(*plane_id).is_some_and(|p| !p.is_bad);
            if good && plane_set.insert(*plane_id) {
                window.planes.push(*plane_id);
            }
        }
    }
    for &kf_id in &window.local_kfs {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        for plane_id in kf.not_seen_plane_ids.iter().flatten() {
            let good = map.get_map_plane(*plane_id).is_some_and(|p| !p.is_bad);
            if good && plane_set.insert(*plane_id) {
                window.not_seen_planes.push(*plane_id);
            }
        }
    }

    // Step 3: Fixed keyframes (observe local landmarks but aren't local)
    let mut fixed_set: HashSet<KeyFrameId> = HashSet::new();
    let mut observers: Vec<KeyFrameId> = Vec::new();
    for mp_id in &window.points {
        if let Some(mp) = map.get_map_point(*mp_id) {
            observers.extend(mp.sorted_observations().into_iter().map(|(kf, _)| kf));
        }
    }
    for plane_id in window.planes.iter().chain(&window.not_seen_planes) {
        if let Some(plane) = map.get_map_plane(*plane_id) {
            for relation in PlaneRelation::ALL {
                observers.extend(plane.sorted_observations(relation).into_iter().map(|(kf, _)| kf));
            }
        }
    }
    for kf_id in observers {
        if local_set.contains(&kf_id) {
            continue;
        }
        let usable = map.get_keyframe(kf_id).is_some_and(|kf| !kf.is_bad);
        if usable && fixed_set.insert(kf_id) {
            window.fixed_kfs.push(kf_id);
        }
    }

    // Step 4: Objects detected in a local keyframe
    if objects {
        for object_id in map.sorted_map_object_ids() {
            let detected = map.get_map_object(object_id).is_some_and(|o| {
                !o.is_bad
                    && window
                        .local_kfs
                        .iter()
                        .any(|kf| o.track.detection(*kf).is_some())
            });
            if detected {
                window.objects.push(object_id);
            }
        }
    }

    Some(window)
}

/// PHASE 1: Select the window and build its graph.
pub fn collect_local_ba_data(
    map: &Map,
    current_kf_id: KeyFrameId,
    config: &LocalBAConfig,
) -> Option<LocalBAProblemData> {
    let window = select_local_window(
        map,
        current_kf_id,
        config.object_mode != ObjectMode::Disabled,
    )?;
    let mut builder = GraphBuilder::new(map, RobustPolicy::new(config.plane));

    for &kf_id in &window.local_kfs {
        builder.add_keyframe(kf_id, false);
    }
    for &kf_id in &window.fixed_kfs {
        builder.add_keyframe(kf_id, true);
    }
    for &mp_id in &window.points {
        if builder.add_point(mp_id).is_some() {
            builder.add_point_observations(mp_id);
        }
    }
    for &plane_id in window.planes.iter().chain(&window.not_seen_planes) {
        if builder.add_plane(plane_id).is_some() {
            builder.add_plane_observations(plane_id);
        }
    }

    // Object edges only tie local keyframes.
    let mut object_tracks = Vec::new();
    match config.object_mode {
        ObjectMode::Disabled => {}
        ObjectMode::DetectionOnly => {
            for &object_id in &window.objects {
                for &kf_id in &window.local_kfs {
                    builder.add_object_detection(kf_id, object_id);
                }
            }
        }
        ObjectMode::FullShape => {
            for &object_id in &window.objects {
                if builder.add_object(object_id).is_none() {
                    continue;
                }
                if let Some(object) = map.get_map_object(object_id) {
                    object_tracks.push((object_id, object.track_id()));
                }
                for &kf_id in &window.local_kfs {
                    builder.add_object_shape_detection(kf_id, object_id);
                }
            }
        }
    }

    if builder.num_edges() == 0 {
        return None;
    }
    Some(LocalBAProblemData {
        current_kf: current_kf_id,
        window,
        object_tracks,
        graph: builder.finish(),
    })
}

/// Whether an edge fails its χ² gate or sees its point behind the camera.
fn is_outlier<E: OptimizationEngine>(
    engine: &E,
    policy: &RobustPolicy,
    kind: FactorKind,
    edge_id: EdgeId,
) -> bool {
    let chi2 = engine.edge_chi2(edge_id).unwrap_or(f64::INFINITY);
    let behind = engine.is_edge_depth_positive(edge_id) == Some(false);
    policy.is_outlier(kind, chi2) || behind
}

/// Engine state after the first, robust pass.
struct FirstPass {
    engine: LevenbergMarquardt,
    edges: Vec<(EdgeTag, EdgeId)>,
    initial_error: f64,
    iterations: usize,
}

/// Load the graph and run the first pass. `None` if the flag is already
/// raised or nothing is left to optimize.
fn run_first_pass(
    graph: Graph,
    config: &LocalBAConfig,
    stop: &Option<StopFlag>,
) -> Option<FirstPass> {
    let mut engine = LevenbergMarquardt::new(config.solver);
    let edges = graph.load_into(&mut engine);
    if let Some(flag) = stop {
        engine.set_stop_flag(flag.clone());
    }

    if stop_requested(stop) || !engine.initialize_optimization(0) {
        return None;
    }
    let initial_error = engine.active_chi2();
    let iterations = match config.object_mode {
        ObjectMode::FullShape => config.shape_first_pass_iterations,
        _ => config.first_pass_iterations,
    };
    let iterations = engine.optimize(iterations);
    Some(FirstPass {
        engine,
        edges,
        initial_error,
        iterations,
    })
}

/// PHASE 2: Two-pass solve and outlier collection.
fn solve_local_ba(
    problem: LocalBAProblemData,
    config: &LocalBAConfig,
    stop: Option<StopFlag>,
) -> Option<LocalBASolution> {
    let ids = problem.graph.ids;
    let first = run_first_pass(problem.graph, config, &stop)?;
    Some(finish_local_ba(
        first,
        ids,
        &problem.window,
        &problem.object_tracks,
        config,
        &stop,
    ))
}

/// Reclassify and run the second pass unless the flag went up during the
/// first one, then gather estimates and outliers.
fn finish_local_ba(
    first: FirstPass,
    ids: IdAllocator,
    window: &LocalWindow,
    object_tracks: &[(MapObjectId, ObjectTrackId)],
    config: &LocalBAConfig,
    stop: &Option<StopFlag>,
) -> LocalBASolution {
    let policy = RobustPolicy::new(config.plane);
    let FirstPass {
        mut engine,
        edges,
        initial_error,
        mut iterations,
    } = first;

    let refined = !stop_requested(stop);
    if refined {
        // Check inlier observations
        let mut n_outliers = 0;
        for (tag, edge_id) in &edges {
            let Some(kind) = tag.factor_kind() else {
                continue;
            };
            if is_outlier(&engine, &policy, kind, *edge_id) {
                engine.set_edge_level(*edge_id, 1);
                n_outliers += 1;
            }
            engine.set_robust_kernel(*edge_id, None);
        }
        debug!(
            "Local BA: {} of {} edges excluded before the second pass",
            n_outliers,
            edges.len()
        );

        // Optimize again without the outliers
        if engine.initialize_optimization(0) {
            iterations += engine.optimize(config.second_pass_iterations);
        }
    }
    let final_error = engine.active_chi2();

    // Check inlier observations
    let mut point_outliers = Vec::new();
    let mut not_seen_outliers = Vec::new();
    let mut kept_plane_outliers = 0;
    for (tag, edge_id) in &edges {
        let Some(kind) = tag.factor_kind() else {
            continue;
        };
        if !is_outlier(&engine, &policy, kind, *edge_id) {
            continue;
        }
        match *tag {
            EdgeTag::Point {
                keyframe, point, ..
            } => point_outliers.push((keyframe, point)),
            EdgeTag::Plane {
                relation: PlaneRelation::NotSeen,
                keyframe,
                plane,
                ..
            } => not_seen_outliers.push((keyframe, plane)),
            EdgeTag::Plane { .. } => kept_plane_outliers += 1,
            EdgeTag::Object { .. } => {}
        }
    }

    let poses = window
        .local_kfs
        .iter()
        .filter_map(|&kf_id| {
            let pose = engine.vertex(ids.keyframe(kf_id)?)?.estimate.as_pose()?;
            Some((kf_id, *pose))
        })
        .collect();
    let points = window
        .points
        .iter()
        .filter_map(|&mp_id| {
            let p = engine.vertex(ids.point(mp_id)?)?.estimate.as_point()?;
            Some((mp_id, *p))
        })
        .collect();
    let planes = window
        .planes
        .iter()
        .chain(&window.not_seen_planes)
        .filter_map(|&plane_id| {
            [true, false].iter().find_map(|&seen| {
                let plane = engine.vertex(ids.plane(plane_id, seen)?)?.estimate.as_plane()?;
                Some((plane_id, *plane))
            })
        })
        .collect();
    let ellipsoids = object_tracks
        .iter()
        .filter_map(|&(object_id, track)| {
            let e = engine.vertex(ids.object(track)?)?.estimate.as_ellipsoid()?;
            Some((object_id, *e))
        })
        .collect();

    LocalBASolution {
        poses,
        points,
        planes,
        ellipsoids,
        point_outliers,
        not_seen_outliers,
        kept_plane_outliers,
        iterations,
        initial_error,
        final_error,
        refined,
        num_edges: edges.len(),
    }
}

/// PHASE 3: Erase outlier relations and write the estimates back.
///
/// Returns the number of (point, plane) relations erased.
fn apply_local_ba_results(
    map: &mut Map,
    current_kf: KeyFrameId,
    window: &LocalWindow,
    solution: &LocalBASolution,
) -> (usize, usize) {
    let mut erased_points = 0;
    for &(kf_id, mp_id) in &solution.point_outliers {
        if map.erase_point_observation(kf_id, mp_id) {
            erased_points += 1;
        }
    }
    let mut erased_planes = 0;
    for &(kf_id, plane_id) in &solution.not_seen_outliers {
        if map.erase_plane_observation(PlaneRelation::NotSeen, kf_id, plane_id) {
            erased_planes += 1;
        }
    }

    // Keyframes
    for (kf_id, pose) in &solution.poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id).filter(|kf| !kf.is_bad) {
            kf.pose_cw = *pose;
            kf.ba_local_for_kf = Some(current_kf);
        }
    }
    for kf_id in &window.fixed_kfs {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.ba_fixed_for_kf = Some(current_kf);
        }
    }

    // Points
    for (mp_id, position) in &solution.points {
        let Some(mp) = map.get_map_point_mut(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        mp.position = *position;
        mp.ba_local_for_kf = Some(current_kf);
        map.update_map_point_normal_and_depth(*mp_id);
    }

    // Planes
    for (plane_id, plane) in &solution.planes {
        if let Some(map_plane) = map.get_map_plane_mut(*plane_id).filter(|p| !p.is_bad) {
            map_plane.plane = *plane;
            map_plane.ba_local_for_kf = Some(current_kf);
        }
    }

    // Objects
    for (object_id, ellipsoid) in &solution.ellipsoids {
        if let Some(object) = map.get_map_object_mut(*object_id).filter(|o| !o.is_bad) {
            object.ellipsoid = *ellipsoid;
        }
    }

    (erased_points, erased_planes)
}

/// Run local bundle adjustment around `current_kf_id`.
///
/// Optimizes:
/// - Poses of local keyframes (the current one and its covisibles)
/// - Points and planes observed by local keyframes
/// - Ellipsoids, in [`ObjectMode::FullShape`]
///
/// Fixed:
/// - Poses of keyframes that observe local landmarks but aren't local
///
/// Returns `None` without touching the map if there is nothing to optimize
/// or the stop flag is already raised. A flag raised during the first pass
/// skips the second one; the first-pass estimates are still written.
pub fn local_bundle_adjustment(
    shared: &SharedMap,
    current_kf_id: KeyFrameId,
    config: &LocalBAConfig,
    stop: Option<StopFlag>,
) -> Option<LocalBAResult> {
    if stop_requested(&stop) {
        return None;
    }

    // Phase 1: Collect
    let problem = {
        let map = shared.read();
        collect_local_ba_data(&map, current_kf_id, config)
    };
    let Some(problem) = problem else {
        debug!("Local BA for {} skipped: nothing to optimize", current_kf_id);
        return None;
    };
    let current_kf = problem.current_kf;
    let window = problem.window.clone();

    // Phase 2: Solve
    let Some(solution) = solve_local_ba(problem, config, stop) else {
        debug!("Local BA for {} stopped before optimizing", current_kf_id);
        return None;
    };

    // Phase 3: Apply
    let (erased_points, erased_planes) = {
        let mut map = shared.write();
        apply_local_ba_results(&mut map, current_kf, &window, &solution)
    };

    let result = LocalBAResult {
        iterations: solution.iterations,
        initial_error: solution.initial_error,
        final_error: solution.final_error,
        num_local_keyframes: window.local_kfs.len(),
        num_fixed_keyframes: window.fixed_kfs.len(),
        num_map_points: window.points.len(),
        num_planes: window.planes.len() + window.not_seen_planes.len(),
        num_objects: window.objects.len(),
        num_edges: solution.num_edges,
        refined: solution.refined,
        erased_point_observations: erased_points,
        erased_plane_observations: erased_planes,
        kept_plane_outliers: solution.kept_plane_outliers,
    };
    info!(
        "Local BA for {}: {} local / {} fixed KFs, {} MPs, {} planes, {} edges, error {:.4} -> {:.4}, erased {} point / {} plane relations",
        current_kf_id,
        result.num_local_keyframes,
        result.num_fixed_keyframes,
        result.num_map_points,
        result.num_planes,
        result.num_edges,
        result.initial_error,
        result.final_error,
        result.erased_point_observations,
        result.erased_plane_observations
    );
    if result.kept_plane_outliers > 0 {
        debug!("Local BA kept {} outlier plane relations", result.kept_plane_outliers);
    }
    Some(result)
}
