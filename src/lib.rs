//! Optimization back end of a visual SLAM system whose map holds points,
//! planes, and ellipsoidal objects.
//!
//! - [`atlas`] - the map store and its locking
//! - [`geometry`] - transforms, camera, planes, ellipsoids
//! - [`tracking`] - the per-frame data pose optimization works on
//! - [`optimizer`] - bundle adjustment, pose and loop-closure optimization
//! - [`config`] - settings file loading

pub mod atlas;
pub mod config;
pub mod geometry;
pub mod optimizer;
pub mod tracking;
