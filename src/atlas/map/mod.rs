//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature/plane observations
//! - [`MapPoint`] - 3D point landmarks
//! - [`MapPlane`] - Plane landmarks with four observation relations
//! - [`MapObject`] - Ellipsoid object landmarks with detection tracks
//! - [`Map`] - Container managing all entities and their relationships
//!
//! # Architecture
//!
//! Relations are stored on both sides as id maps:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`, MP → KF via `observations`)
//! - KeyFrames observe MapPlanes per [`PlaneRelation`]
//!
//! KeyFrames also maintain the covisibility graph, the spanning tree, and
//! loop edges used by the essential-graph optimization.

pub mod keyframe;
pub mod map;
pub mod map_object;
pub mod map_plane;
pub mod map_point;
pub mod types;

pub use keyframe::{KeyFrame, KeyPoint, ScalePyramid};
pub use map::Map;
pub use map_object::{MapObject, ObjectTrack};
pub use map_plane::{MapPlane, PlaneRelation};
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapObjectId, MapPlaneId, MapPointId, ObjectTrackId};
