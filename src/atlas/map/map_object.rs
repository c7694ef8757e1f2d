//! MapObject - An ellipsoid landmark tied to a detection track.

use std::collections::HashMap;

use crate::geometry::{BoundingBox, Ellipsoid};

use super::types::{KeyFrameId, MapObjectId, ObjectTrackId};

/// Detections of one object across keyframes.
#[derive(Debug, Clone, Default)]
pub struct ObjectTrack {
    pub id: ObjectTrackId,
    pub category: u32,
    detections: HashMap<KeyFrameId, BoundingBox>,
}

impl ObjectTrack {
    pub fn new(id: ObjectTrackId, category: u32) -> Self {
        Self {
            id,
            category,
            detections: HashMap::new(),
        }
    }

    pub fn add_detection(&mut self, kf_id: KeyFrameId, bbox: BoundingBox) {
        self.detections.insert(kf_id, bbox);
    }

    /// Detection box in `kf_id`, if the object was detected there.
    pub fn detection(&self, kf_id: KeyFrameId) -> Option<&BoundingBox> {
        self.detections.get(&kf_id)
    }

    pub fn erase_detection(&mut self, kf_id: KeyFrameId) -> Option<BoundingBox> {
        self.detections.remove(&kf_id)
    }

    pub fn num_detections(&self) -> usize {
        self.detections.len()
    }
}

impl Default for ObjectTrackId {
    fn default() -> Self {
        ObjectTrackId(0)
    }
}

#[derive(Debug, Clone)]
pub struct MapObject {
    pub id: MapObjectId,
    pub ellipsoid: Ellipsoid,
    pub track: ObjectTrack,
    pub is_bad: bool,
}

impl MapObject {
    pub fn new(id: MapObjectId, ellipsoid: Ellipsoid, track: ObjectTrack) -> Self {
        Self {
            id,
            ellipsoid,
            track,
            is_bad: false,
        }
    }

    pub fn track_id(&self) -> ObjectTrackId {
        self.track.id
    }
}
