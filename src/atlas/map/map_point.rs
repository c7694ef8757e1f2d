//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Besides its observations, a MapPoint carries the staging fields that loop
//! correction and global BA use to hand results back to the map.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};

#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Observing keyframe → feature index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Keyframe the point is anchored to for loop correction and depth limits.
    pub reference_kf: KeyFrameId,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance limits.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Set when loop correction already moved this point with the keyframe
    /// given here.
    pub corrected_by_kf: Option<KeyFrameId>,

    /// Keyframe whose correction was applied to this point.
    pub corrected_reference: Option<KeyFrameId>,

    pub ba_local_for_kf: Option<KeyFrameId>,
    pub ba_global_for_kf: Option<KeyFrameId>,

    /// Staged global BA position.
    pub position_gba: Option<Vector3<f64>>,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, reference_kf: KeyFrameId) -> Self {
        Self {
            id,
            position,
            observations: HashMap::new(),
            reference_kf,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            corrected_by_kf: None,
            corrected_reference: None,
            ba_local_for_kf: None,
            ba_global_for_kf: None,
            position_gba: None,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Feature index of this point in `kf_id`, if observed there.
    pub fn index_in_keyframe(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    /// Observations sorted by keyframe id.
    pub fn sorted_observations(&self) -> Vec<(KeyFrameId, usize)> {
        let mut obs: Vec<(KeyFrameId, usize)> =
            self.observations.iter().map(|(k, i)| (*k, *i)).collect();
        obs.sort();
        obs
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observations() {
        let mut mp = MapPoint::new(
            MapPointId::new(1),
            Vector3::new(1.0, 2.0, 3.0),
            KeyFrameId::new(0),
        );

        mp.add_observation(KeyFrameId::new(2), 7);
        mp.add_observation(KeyFrameId::new(1), 3);
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.index_in_keyframe(KeyFrameId::new(2)), Some(7));
        assert_eq!(
            mp.sorted_observations(),
            vec![(KeyFrameId::new(1), 3), (KeyFrameId::new(2), 7)]
        );

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.index_in_keyframe(KeyFrameId::new(1)), None);
    }

    #[test]
    fn test_new_point_has_no_staging() {
        let mp = MapPoint::new(MapPointId::new(5), Vector3::zeros(), KeyFrameId::new(2));
        assert!(mp.position_gba.is_none());
        assert!(mp.corrected_by_kf.is_none());
        assert!(!mp.is_bad);
    }
}
