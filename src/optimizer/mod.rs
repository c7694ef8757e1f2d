//! Graph optimization for the point/plane/object map.
//!
//! - [`engine`], [`factors`], [`lm`] - the engine contract and its sparse
//!   Levenberg-Marquardt implementation
//! - [`robust`] - information weighting and χ² gating shared by every adjuster
//! - [`graph_builder`] - turns map entities into vertices and edges
//! - [`global_ba`], [`local_ba`] - bundle adjustment over the whole map or a
//!   covisibility window
//! - [`pose_optimization`] - pose-only refinement of a tracked frame
//! - [`essential_graph`], [`sim3_refine`] - loop-closure corrections

pub mod engine;
pub mod essential_graph;
pub mod factors;
pub mod global_ba;
pub mod graph_builder;
pub mod lm;
pub mod local_ba;
pub mod pose_optimization;
pub mod robust;
pub mod sim3_refine;

#[cfg(test)]
pub(crate) mod test_scene;

pub use engine::{Edge, EdgeId, OptimizationEngine};
pub use essential_graph::{
    optimize_essential_graph, EssentialGraphConfig, EssentialGraphResult, KeyFrameAndPose,
};
pub use factors::{Factor, Vertex, VertexEstimate, VertexId};
pub use global_ba::{global_bundle_adjustment, GlobalBAConfig, GlobalBAResult};
pub use graph_builder::{GraphBuilder, IdAllocator};
pub use lm::{LevenbergMarquardt, LevenbergMarquardtConfig};
pub use local_ba::{local_bundle_adjustment, LocalBAConfig, LocalBAResult, ObjectMode};
pub use pose_optimization::{pose_optimization, PoseOptimizationConfig};
pub use robust::{FactorKind, RobustPolicy};
pub use sim3_refine::{optimize_sim3, Sim3RefineConfig};
