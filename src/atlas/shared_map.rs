//! Map shared between the tracking, mapping, and loop-closing threads.
//!
//! Two locks with explicit scope:
//! - `map`: guards all structural mutation (creation, erasure, pose writes).
//!   Optimizers take the read side only to snapshot the graph inputs and the
//!   write side only around write-back; the solve itself runs unlocked, so
//!   entities may turn bad in between and every write-back re-checks.
//! - `point_creation`: guards id allocation for new point landmarks, so new
//!   points can be created while an adjustment holds its snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::map::{KeyFrameId, Map, MapPoint, MapPointId};

/// Cooperative cancellation flag polled by the optimizer between iterations.
pub type StopFlag = Arc<AtomicBool>;

pub struct SharedMap {
    map: RwLock<Map>,
    point_creation: Mutex<u64>,

    /// Set by tracking when a new keyframe arrives to cut a local BA short.
    pub abort_ba: StopFlag,
}

impl SharedMap {
    pub fn new(map: Map) -> Arc<Self> {
        let next_point = map.max_map_point_id().map_or(0, |id| id.0 + 1);
        Arc::new(Self {
            map: RwLock::new(map),
            point_creation: Mutex::new(next_point),
            abort_ba: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Map> {
        self.map.read()
    }

    /// Map-wide update lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, Map> {
        self.map.write()
    }

    /// Allocate a point id without touching the map lock.
    pub fn allocate_point_id(&self) -> MapPointId {
        let mut next = self.point_creation.lock();
        let id = MapPointId::new(*next);
        *next += 1;
        id
    }

    /// Create and register a point anchored to `reference_kf`.
    pub fn create_map_point(&self, position: Vector3<f64>, reference_kf: KeyFrameId) -> MapPointId {
        let id = self.allocate_point_id();
        self.map.write().add_map_point(MapPoint::new(id, position, reference_kf));
        id
    }

    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }
}

impl Default for SharedMap {
    fn default() -> Self {
        Self {
            map: RwLock::new(Map::new()),
            point_creation: Mutex::new(0),
            abort_ba: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_ids_are_unique_across_threads() {
        let shared = SharedMap::new(Map::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| shared.allocate_point_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<MapPointId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn test_allocation_continues_after_existing_points() {
        let mut map = Map::new();
        map.add_map_point(MapPoint::new(MapPointId::new(41), Vector3::zeros(), KeyFrameId::new(0)));
        let shared = SharedMap::new(map);
        let id = shared.create_map_point(Vector3::new(1.0, 0.0, 0.0), KeyFrameId::new(0));
        assert_eq!(id, MapPointId::new(42));
        assert_eq!(shared.read().num_map_points(), 2);
    }

    #[test]
    fn test_abort_flag() {
        let shared = SharedMap::new(Map::new());
        assert!(!shared.should_abort_ba());
        shared.request_abort_ba();
        assert!(shared.abort_ba.load(Ordering::SeqCst));
        shared.clear_abort_ba();
        assert!(!shared.should_abort_ba());
    }
}
