//! Levenberg-Marquardt engine with Schur elimination of marginalized vertices.
//!
//! The normal equations are split into a reduced block (poses, similarities,
//! planes, ellipsoids) and one diagonal block per marginalized landmark:
//!
//! ```text
//! [ H_pp  H_pl ] [dp]   [b_p]
//! [ H_lp  H_ll ] [dl] = [b_l]
//! ```
//!
//! Landmarks are eliminated first, `(H_pp - H_pl H_ll^-1 H_lp) dp = b_p - H_pl H_ll^-1 b_l`,
//! then back-substituted. If an active edge ties two marginalized vertices
//! together the elimination is not block diagonal and everything is solved in
//! the reduced system instead.
//!
//! Damping and step control follow g2o: `lambda` starts at `tau * max(diag H)`
//! (or a user value), a step is accepted when the gain ratio is positive, and
//! a rejected step multiplies `lambda` by a growing factor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::atlas::StopFlag;

use super::engine::{Edge, EdgeId, OptimizationEngine};
use super::factors::{Vertex, VertexEstimate, VertexId};
use super::robust::huber;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardtConfig {
    /// Fixed starting damping; `None` derives it from the Hessian diagonal.
    pub initial_lambda: Option<f64>,
    pub tau: f64,
    /// Damping trials per iteration before giving up.
    pub max_trials: usize,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            initial_lambda: None,
            tau: 1e-5,
            max_trials: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Reduced { offset: usize, dim: usize },
    Landmark { index: usize, dim: usize },
}

#[derive(Debug, Clone)]
struct Layout {
    slots: HashMap<VertexId, Slot>,
    /// Slot order, for deterministic updates.
    order: Vec<VertexId>,
    reduced_dim: usize,
    landmark_dims: Vec<usize>,
    active_edges: Vec<EdgeId>,
}

struct LandmarkBlock {
    h_ll: DMatrix<f64>,
    b_l: DVector<f64>,
    /// `H_pl` blocks keyed by reduced offset.
    couplings: BTreeMap<usize, DMatrix<f64>>,
}

struct LinearSystem {
    h_pp: DMatrix<f64>,
    b_p: DVector<f64>,
    landmarks: Vec<LandmarkBlock>,
}

impl LinearSystem {
    fn max_diagonal(&self) -> f64 {
        let reduced = self.h_pp.diagonal().iter().copied().fold(0.0, f64::max);
        self.landmarks
            .iter()
            .map(|lm| lm.h_ll.diagonal().max())
            .fold(reduced, f64::max)
    }
}

struct Step {
    reduced: DVector<f64>,
    landmarks: Vec<DVector<f64>>,
}

#[derive(Debug, Default)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    vertices: HashMap<VertexId, Vertex>,
    edges: BTreeMap<EdgeId, Edge>,
    incident: HashMap<VertexId, BTreeSet<EdgeId>>,
    next_edge_id: EdgeId,
    level: usize,
    layout: Option<Layout>,
    stop: Option<StopFlag>,
}

impl LevenbergMarquardt {
    pub fn new(config: LevenbergMarquardtConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn is_active(&self, edge: &Edge, level: usize) -> bool {
        edge.level == level
            && edge
                .factor
                .vertices()
                .iter()
                .all(|id| self.vertices.contains_key(id))
    }

    fn build_layout(&self, level: usize) -> Option<Layout> {
        let active_edges: Vec<EdgeId> = self
            .edges
            .iter()
            .filter(|(_, edge)| self.is_active(edge, level))
            .map(|(&id, _)| id)
            .collect();

        let mut touched = BTreeSet::new();
        let mut schur_valid = true;
        for id in &active_edges {
            let mut marginalized = 0;
            for v in self.edges[id].factor.vertices() {
                let vertex = &self.vertices[&v];
                if vertex.fixed {
                    continue;
                }
                touched.insert(v);
                if vertex.marginalized {
                    marginalized += 1;
                }
            }
            if marginalized > 1 {
                schur_valid = false;
            }
        }
        if touched.is_empty() {
            return None;
        }
        if !schur_valid {
            debug!("Marginalized vertices are coupled, solving without elimination");
        }

        let mut slots = HashMap::with_capacity(touched.len());
        let mut order = Vec::with_capacity(touched.len());
        let mut reduced_dim = 0;
        let mut landmark_dims = Vec::new();
        for &id in &touched {
            let vertex = &self.vertices[&id];
            let dim = vertex.estimate.dimension();
            if schur_valid && vertex.marginalized {
                slots.insert(
                    id,
                    Slot::Landmark {
                        index: landmark_dims.len(),
                        dim,
                    },
                );
                landmark_dims.push(dim);
            } else {
                slots.insert(
                    id,
                    Slot::Reduced {
                        offset: reduced_dim,
                        dim,
                    },
                );
                reduced_dim += dim;
            }
            order.push(id);
        }

        Some(Layout {
            slots,
            order,
            reduced_dim,
            landmark_dims,
            active_edges,
        })
    }

    fn edge_error(&self, edge: &Edge) -> Option<(DVector<f64>, f64)> {
        let e = edge.factor.error(&self.vertices)?;
        let chi2 = (e.transpose() * &edge.information * &e)[(0, 0)];
        Some((e, chi2))
    }

    fn robust_cost(&self, edges: &[EdgeId]) -> f64 {
        let mut total = 0.0;
        for id in edges {
            let edge = &self.edges[id];
            if let Some((_, chi2)) = self.edge_error(edge) {
                if !chi2.is_finite() {
                    return f64::INFINITY;
                }
                total += huber(chi2, edge.robust_delta).0;
            }
        }
        total
    }

    fn linearize(&self, layout: &Layout) -> LinearSystem {
        let n = layout.reduced_dim;
        let mut h_pp = DMatrix::zeros(n, n);
        let mut b_p = DVector::zeros(n);
        let mut landmarks: Vec<LandmarkBlock> = layout
            .landmark_dims
            .iter()
            .map(|&dim| LandmarkBlock {
                h_ll: DMatrix::zeros(dim, dim),
                b_l: DVector::zeros(dim),
                couplings: BTreeMap::new(),
            })
            .collect();

        for id in &layout.active_edges {
            let edge = &self.edges[id];
            let Some((e, chi2)) = self.edge_error(edge) else {
                continue;
            };
            if !chi2.is_finite() {
                continue;
            }
            let wanted: Vec<VertexId> = edge
                .factor
                .vertices()
                .into_iter()
                .filter(|v| layout.slots.contains_key(v))
                .collect();
            if wanted.is_empty() {
                continue;
            }
            let Some(jacobians) = edge.factor.jacobians(&self.vertices, &wanted) else {
                continue;
            };
            let (_, weight) = huber(chi2, edge.robust_delta);
            let omega = &edge.information * weight;

            for (va, ja) in &jacobians {
                let jt_omega = ja.transpose() * &omega;
                let gradient = -(&jt_omega * &e);
                let slot_a = layout.slots[va];
                match slot_a {
                    Slot::Reduced { offset, dim } => {
                        let mut rows = b_p.rows_mut(offset, dim);
                        rows += &gradient;
                    }
                    Slot::Landmark { index, .. } => landmarks[index].b_l += &gradient,
                }

                for (vb, jb) in &jacobians {
                    let block = &jt_omega * jb;
                    match (slot_a, layout.slots[vb]) {
                        (
                            Slot::Reduced { offset: oa, dim: da },
                            Slot::Reduced { offset: ob, dim: db },
                        ) => {
                            let mut view = h_pp.view_mut((oa, ob), (da, db));
                            view += &block;
                        }
                        (Slot::Landmark { index: la, .. }, Slot::Landmark { index: lb, .. })
                            if la == lb =>
                        {
                            landmarks[la].h_ll += &block;
                        }
                        (Slot::Reduced { offset, dim }, Slot::Landmark { index, dim: dl }) => {
                            let coupling = landmarks[index]
                                .couplings
                                .entry(offset)
                                .or_insert_with(|| DMatrix::zeros(dim, dl));
                            *coupling += &block;
                        }
                        _ => {}
                    }
                }
            }
        }

        LinearSystem {
            h_pp,
            b_p,
            landmarks,
        }
    }

    /// Solve the damped system; `None` if the reduced system is singular.
    fn solve(system: &LinearSystem, lambda: f64) -> Option<Step> {
        let n = system.h_pp.nrows();
        let mut s = system.h_pp.clone();
        for i in 0..n {
            s[(i, i)] += lambda;
        }
        let mut rhs = system.b_p.clone();

        let mut inverses = Vec::with_capacity(system.landmarks.len());
        for lm in &system.landmarks {
            let mut h_ll = lm.h_ll.clone();
            for i in 0..h_ll.nrows() {
                h_ll[(i, i)] += lambda;
            }
            let Some(inv) = h_ll.try_inverse() else {
                inverses.push(None);
                continue;
            };
            for (&oa, wa) in &lm.couplings {
                let wa_inv = wa * &inv;
                let mut rows = rhs.rows_mut(oa, wa.nrows());
                rows -= &wa_inv * &lm.b_l;
                for (&ob, wb) in &lm.couplings {
                    let mut view = s.view_mut((oa, ob), (wa.nrows(), wb.nrows()));
                    view -= &wa_inv * wb.transpose();
                }
            }
            inverses.push(Some(inv));
        }

        let reduced = if n > 0 {
            s.lu().solve(&rhs)?
        } else {
            DVector::zeros(0)
        };
        if reduced.iter().any(|x| !x.is_finite()) {
            return None;
        }

        let landmarks = system
            .landmarks
            .iter()
            .zip(inverses)
            .map(|(lm, inv)| match inv {
                Some(inv) => {
                    let mut r = lm.b_l.clone();
                    for (&oa, wa) in &lm.couplings {
                        r -= wa.transpose() * reduced.rows(oa, wa.nrows());
                    }
                    inv * r
                }
                None => DVector::zeros(lm.b_l.len()),
            })
            .collect();

        Some(Step { reduced, landmarks })
    }

    /// `dx^T (lambda dx + b)`, the reduction predicted by the damped model.
    fn predicted_reduction(system: &LinearSystem, step: &Step, lambda: f64) -> f64 {
        let mut scale = step
            .reduced
            .dot(&(&step.reduced * lambda + &system.b_p));
        for (lm, dl) in system.landmarks.iter().zip(&step.landmarks) {
            scale += dl.dot(&(dl * lambda + &lm.b_l));
        }
        scale
    }

    fn backup(&self, layout: &Layout) -> Vec<(VertexId, VertexEstimate)> {
        layout
            .order
            .iter()
            .filter_map(|id| self.vertices.get(id).map(|v| (*id, v.estimate.clone())))
            .collect()
    }

    fn restore(&mut self, backup: Vec<(VertexId, VertexEstimate)>) {
        for (id, estimate) in backup {
            if let Some(v) = self.vertices.get_mut(&id) {
                v.estimate = estimate;
            }
        }
    }

    fn apply_step(&mut self, layout: &Layout, step: &Step) {
        for id in &layout.order {
            let delta: &[f64] = match layout.slots[id] {
                Slot::Reduced { offset, dim } => &step.reduced.as_slice()[offset..offset + dim],
                Slot::Landmark { index, .. } => step.landmarks[index].as_slice(),
            };
            if let Some(v) = self.vertices.get_mut(id) {
                v.estimate.oplus(delta);
            }
        }
    }

    fn invalidate(&mut self) {
        self.layout = None;
    }
}

impl OptimizationEngine for LevenbergMarquardt {
    fn add_vertex(&mut self, vertex: Vertex) -> bool {
        if self.vertices.contains_key(&vertex.id) {
            return false;
        }
        self.vertices.insert(vertex.id, vertex);
        self.invalidate();
        true
    }

    fn add_edge(&mut self, edge: Edge) -> Option<EdgeId> {
        let vertices = edge.factor.vertices();
        if !vertices.iter().all(|v| self.vertices.contains_key(v)) {
            return None;
        }
        let dim = edge.factor.dimension();
        if edge.information.shape() != (dim, dim) {
            return None;
        }
        let id = self.next_edge_id;
        self.next_edge_id += 1;
        for v in vertices {
            self.incident.entry(v).or_default().insert(id);
        }
        self.edges.insert(id, edge);
        self.invalidate();
        Some(id)
    }

    fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    fn set_estimate(&mut self, id: VertexId, estimate: VertexEstimate) -> bool {
        match self.vertices.get_mut(&id) {
            Some(v) if v.estimate.dimension() == estimate.dimension() => {
                v.estimate = estimate;
                true
            }
            _ => false,
        }
    }

    fn remove_vertex(&mut self, id: VertexId) -> bool {
        if self.vertices.remove(&id).is_none() {
            return false;
        }
        for edge_id in self.incident.remove(&id).unwrap_or_default() {
            self.remove_edge(edge_id);
        }
        self.invalidate();
        true
    }

    fn remove_edge(&mut self, id: EdgeId) -> bool {
        let Some(edge) = self.edges.remove(&id) else {
            return false;
        };
        for v in edge.factor.vertices() {
            if let Some(set) = self.incident.get_mut(&v) {
                set.remove(&id);
            }
        }
        self.invalidate();
        true
    }

    fn set_edge_level(&mut self, id: EdgeId, level: usize) -> bool {
        let Some(edge) = self.edges.get_mut(&id) else {
            return false;
        };
        if edge.level != level {
            edge.level = level;
            self.invalidate();
        }
        true
    }

    fn set_robust_kernel(&mut self, id: EdgeId, delta: Option<f64>) -> bool {
        match self.edges.get_mut(&id) {
            Some(edge) => {
                edge.robust_delta = delta;
                true
            }
            None => false,
        }
    }

    fn vertex_edge_count(&self, id: VertexId) -> usize {
        self.incident.get(&id).map_or(0, BTreeSet::len)
    }

    fn edge_chi2(&self, id: EdgeId) -> Option<f64> {
        self.edge_error(self.edges.get(&id)?).map(|(_, chi2)| chi2)
    }

    fn is_edge_depth_positive(&self, id: EdgeId) -> Option<bool> {
        self.edges.get(&id)?.factor.is_depth_positive(&self.vertices)
    }

    fn set_stop_flag(&mut self, flag: StopFlag) {
        self.stop = Some(flag);
    }

    fn initialize_optimization(&mut self, level: usize) -> bool {
        self.level = level;
        self.layout = self.build_layout(level);
        self.layout.is_some()
    }

    fn optimize(&mut self, iterations: usize) -> usize {
        if self.layout.is_none() && !self.initialize_optimization(self.level) {
            return 0;
        }
        let Some(layout) = self.layout.take() else {
            return 0;
        };

        let initial_chi2 = self.robust_cost(&layout.active_edges);
        let mut current_chi2 = initial_chi2;
        let mut lambda = self.config.initial_lambda;
        let mut ni = 2.0;
        let mut performed = 0;

        for iteration in 0..iterations {
            if self.stop_requested() {
                debug!("Optimization stopped externally at iteration {}", iteration);
                break;
            }
            let system = self.linearize(&layout);
            let mut lam = match lambda {
                Some(l) => l,
                None => (self.config.tau * system.max_diagonal()).max(f64::EPSILON),
            };

            let mut accepted = false;
            for _ in 0..self.config.max_trials {
                let Some(step) = Self::solve(&system, lam) else {
                    lam *= ni;
                    ni *= 2.0;
                    continue;
                };
                let backup = self.backup(&layout);
                self.apply_step(&layout, &step);
                let new_chi2 = self.robust_cost(&layout.active_edges);
                let scale = Self::predicted_reduction(&system, &step, lam) + 1e-3;
                let rho = (current_chi2 - new_chi2) / scale;
                if rho > 0.0 && new_chi2.is_finite() {
                    let alpha = 1.0 - (2.0 * rho - 1.0).powi(3);
                    lam *= alpha.max(1.0 / 3.0);
                    ni = 2.0;
                    current_chi2 = new_chi2;
                    accepted = true;
                    break;
                }
                self.restore(backup);
                lam *= ni;
                ni *= 2.0;
                if !lam.is_finite() {
                    break;
                }
            }
            lambda = Some(lam);
            performed += 1;
            if !accepted {
                debug!("No improving step at iteration {}, lambda {:.3e}", iteration, lam);
                break;
            }
        }

        debug!(
            "LM: {} iterations, {} edges, chi2 {:.4} -> {:.4}",
            performed,
            layout.active_edges.len(),
            initial_chi2,
            current_chi2
        );
        self.layout = Some(layout);
        performed
    }

    fn active_chi2(&self) -> f64 {
        match &self.layout {
            Some(layout) => self.robust_cost(&layout.active_edges),
            None => {
                let active: Vec<EdgeId> = self
                    .edges
                    .iter()
                    .filter(|(_, e)| self.is_active(e, self.level))
                    .map(|(&id, _)| id)
                    .collect();
                self.robust_cost(&active)
            }
        }
    }

    fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    fn num_edges(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraIntrinsics, SE3};
    use crate::optimizer::factors::Factor;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0)
    }

    fn poses() -> Vec<SE3> {
        (0..3)
            .map(|i| {
                let x = i as f64 * 0.5;
                SE3::new(
                    UnitQuaternion::from_euler_angles(0.0, -0.05 * i as f64, 0.0),
                    Vector3::new(-x, 0.0, 0.0),
                )
            })
            .collect()
    }

    fn points(rng: &mut StdRng, n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..7.0),
                )
            })
            .collect()
    }

    /// Two fixed poses, one free pose and noisy points.
    fn build(marginalize: bool, noise: f64) -> (LevenbergMarquardt, Vec<Vector3<f64>>, SE3) {
        let mut rng = StdRng::seed_from_u64(7);
        let truth_poses = poses();
        let truth_points = points(&mut rng, 30);
        let cam = camera();

        let mut engine = LevenbergMarquardt::default();
        for (i, pose) in truth_poses.iter().enumerate() {
            let estimate = if i == 2 {
                pose.retract_left(&nalgebra::Vector6::new(0.01, -0.01, 0.005, 0.03, -0.02, 0.02))
            } else {
                *pose
            };
            assert!(engine.add_vertex(Vertex::new(i, VertexEstimate::Pose(estimate)).fixed(i < 2)));
        }
        for (j, p) in truth_points.iter().enumerate() {
            let id = 10 + j;
            let noisy = if noise > 0.0 {
                p + Vector3::new(
                    rng.gen_range(-noise..noise),
                    rng.gen_range(-noise..noise),
                    rng.gen_range(-noise..noise),
                )
            } else {
                *p
            };
            engine.add_vertex(
                Vertex::new(id, VertexEstimate::Point(noisy)).marginalized(marginalize),
            );
            for (i, pose) in truth_poses.iter().enumerate() {
                let measurement = cam.project(&pose.transform_point(p));
                let factor = Factor::MonoProjection {
                    pose: i,
                    point: id,
                    measurement,
                    camera: cam,
                };
                assert!(engine.add_edge(Edge::new(factor, DMatrix::identity(2, 2))).is_some());
            }
        }
        (engine, truth_points, truth_poses[2])
    }

    #[test]
    fn test_converges_on_exact_measurements() {
        let (mut engine, truth_points, truth_pose) = build(true, 0.05);
        assert!(engine.initialize_optimization(0));
        let before = engine.active_chi2();
        let iterations = engine.optimize(20);
        assert!(iterations > 0);
        assert!(engine.active_chi2() < before * 1e-6);

        let pose = engine.vertex(2).unwrap().estimate.as_pose().copied().unwrap();
        assert_relative_eq!(pose.translation, truth_pose.translation, epsilon = 1e-4);
        let p0 = engine.vertex(10).unwrap().estimate.as_point().copied().unwrap();
        assert_relative_eq!(p0, truth_points[0], epsilon = 1e-4);
    }

    #[test]
    fn test_fixed_vertices_are_untouched() {
        let (mut engine, _, _) = build(true, 0.05);
        let before = engine.vertex(0).unwrap().estimate.clone();
        engine.initialize_optimization(0);
        engine.optimize(10);
        assert_eq!(engine.vertex(0).unwrap().estimate, before);
    }

    #[test]
    fn test_schur_and_dense_agree() {
        let (mut schur, _, _) = build(true, 0.05);
        let (mut dense, _, _) = build(false, 0.05);
        schur.initialize_optimization(0);
        dense.initialize_optimization(0);
        schur.optimize(3);
        dense.optimize(3);
        let a = schur.vertex(2).unwrap().estimate.as_pose().copied().unwrap();
        let b = dense.vertex(2).unwrap().estimate.as_pose().copied().unwrap();
        assert_relative_eq!(a.translation, b.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_raised_stop_flag_prevents_iterations() {
        let (mut engine, _, _) = build(true, 0.05);
        let flag = Arc::new(AtomicBool::new(true));
        engine.set_stop_flag(flag);
        engine.initialize_optimization(0);
        assert_eq!(engine.optimize(10), 0);
    }

    #[test]
    fn test_inactive_level_and_removal() {
        let (mut engine, _, _) = build(true, 0.0);
        let edges_before = engine.num_edges();
        for id in 0..edges_before {
            engine.set_edge_level(id, 1);
        }
        assert!(!engine.initialize_optimization(0));
        assert_eq!(engine.optimize(5), 0);

        assert_eq!(engine.vertex_edge_count(10), 3);
        assert!(engine.remove_vertex(10));
        assert_eq!(engine.num_edges(), edges_before - 3);
        assert_eq!(engine.vertex_edge_count(10), 0);
        assert!(engine.edge_chi2(0).is_none());
    }

    #[test]
    fn test_exact_start_has_zero_error() {
        let (mut engine, truth_points, _) = build(true, 0.0);
        let p0 = engine.vertex(10).unwrap().estimate.as_point().copied().unwrap();
        assert_eq!(p0, truth_points[0]);
        assert!(engine.initialize_optimization(0));
        let first_pose_chi2: Vec<f64> = (0..engine.num_edges())
            .step_by(3)
            .filter_map(|id| engine.edge_chi2(id))
            .collect();
        assert_eq!(first_pose_chi2.len(), 30);
        for chi2 in first_pose_chi2 {
            assert_relative_eq!(chi2, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_edges_need_existing_vertices_and_matching_information() {
        let mut engine = LevenbergMarquardt::default();
        engine.add_vertex(Vertex::new(0, VertexEstimate::Pose(SE3::identity())));
        let factor = Factor::MonoProjection {
            pose: 0,
            point: 1,
            measurement: nalgebra::Vector2::new(1.0, 2.0),
            camera: camera(),
        };
        assert!(engine.add_edge(Edge::new(factor.clone(), DMatrix::identity(2, 2))).is_none());
        engine.add_vertex(Vertex::new(1, VertexEstimate::Point(Vector3::new(0.0, 0.0, 3.0))));
        assert!(engine.add_edge(Edge::new(factor.clone(), DMatrix::identity(3, 3))).is_none());
        assert!(engine.add_edge(Edge::new(factor, DMatrix::identity(2, 2))).is_some());
        assert!(!engine.add_vertex(Vertex::new(1, VertexEstimate::Point(Vector3::zeros()))));
    }
}
