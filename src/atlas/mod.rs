//! Atlas module - map storage shared by the optimizers.
//!
//! - [`map`] - keyframes, point/plane/object landmarks, and their relations
//! - [`shared_map`] - the lock discipline around a [`Map`]

pub mod map;
pub mod shared_map;

pub use map::{
    KeyFrame, KeyFrameId, Map, MapObject, MapObjectId, MapPlane, MapPlaneId, MapPoint, MapPointId,
    PlaneRelation,
};
pub use shared_map::{SharedMap, StopFlag};
