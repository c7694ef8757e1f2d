//! The optimization-engine contract the adjusters program against.
//!
//! An engine owns a graph of [`Vertex`]es and [`Edge`]s in a single integer id
//! space. Edges carry a level; only edges at the level chosen by
//! [`OptimizationEngine::initialize_optimization`] take part in the next
//! `optimize` call, which is how outliers are switched off without deleting
//! them.

use nalgebra::DMatrix;

use crate::atlas::StopFlag;

use super::factors::{Factor, Vertex, VertexEstimate, VertexId};

pub type EdgeId = usize;

/// A factor with its weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub factor: Factor,
    pub information: DMatrix<f64>,
    /// Huber width on the whitened residual norm, if robustified.
    pub robust_delta: Option<f64>,
    pub level: usize,
}

impl Edge {
    pub fn new(factor: Factor, information: DMatrix<f64>) -> Self {
        Self {
            factor,
            information,
            robust_delta: None,
            level: 0,
        }
    }

    pub fn with_huber(mut self, delta: f64) -> Self {
        self.robust_delta = Some(delta);
        self
    }
}

pub trait OptimizationEngine {
    /// Returns false if the id is already taken.
    fn add_vertex(&mut self, vertex: Vertex) -> bool;

    /// Returns `None` if any referenced vertex is missing or the information
    /// matrix does not match the residual dimension.
    fn add_edge(&mut self, edge: Edge) -> Option<EdgeId>;

    fn vertex(&self, id: VertexId) -> Option<&Vertex>;

    fn has_vertex(&self, id: VertexId) -> bool {
        self.vertex(id).is_some()
    }

    fn edge(&self, id: EdgeId) -> Option<&Edge>;

    fn set_estimate(&mut self, id: VertexId, estimate: VertexEstimate) -> bool;

    /// Remove a vertex together with all of its edges.
    fn remove_vertex(&mut self, id: VertexId) -> bool;

    fn remove_edge(&mut self, id: EdgeId) -> bool;

    fn set_edge_level(&mut self, id: EdgeId, level: usize) -> bool;

    fn set_robust_kernel(&mut self, id: EdgeId, delta: Option<f64>) -> bool;

    /// Number of edges (at any level) touching the vertex.
    fn vertex_edge_count(&self, id: VertexId) -> usize;

    /// Unweighted `e^T Ω e` at the current estimates.
    fn edge_chi2(&self, id: EdgeId) -> Option<f64>;

    /// Depth check for point-observing edges; `None` for other kinds.
    fn is_edge_depth_positive(&self, id: EdgeId) -> Option<bool>;

    /// Polled once per iteration; a raised flag ends `optimize` early.
    fn set_stop_flag(&mut self, flag: StopFlag);

    /// Select the edges at `level` and lay out the normal equations.
    /// Returns false if nothing is left to optimize.
    fn initialize_optimization(&mut self, level: usize) -> bool;

    /// Run up to `iterations` iterations; returns how many were performed.
    fn optimize(&mut self, iterations: usize) -> usize;

    /// Robustified cost over the active edges.
    fn active_chi2(&self) -> f64;

    fn num_vertices(&self) -> usize;
    fn num_edges(&self) -> usize;
}
