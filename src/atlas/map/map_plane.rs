//! MapPlane - An infinite plane landmark.
//!
//! A plane keeps four observation relations with keyframes: directly seen as
//! the same surface, inferred but not seen, parallel to an observed plane, and
//! perpendicular to an observed plane. Each relation maps an observing keyframe
//! to the index of the observation inside that keyframe.

use std::collections::HashMap;

use crate::geometry::Plane3;

use super::types::{KeyFrameId, MapPlaneId};

/// The relation a keyframe observation has with a plane landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneRelation {
    Seen,
    NotSeen,
    Parallel,
    Vertical,
}

impl PlaneRelation {
    pub const ALL: [PlaneRelation; 4] = [
        PlaneRelation::Seen,
        PlaneRelation::NotSeen,
        PlaneRelation::Parallel,
        PlaneRelation::Vertical,
    ];
}

#[derive(Debug, Clone)]
pub struct MapPlane {
    pub id: MapPlaneId,

    /// World-frame coefficients.
    pub plane: Plane3,

    observations: HashMap<KeyFrameId, usize>,
    not_seen_observations: HashMap<KeyFrameId, usize>,
    parallel_observations: HashMap<KeyFrameId, usize>,
    vertical_observations: HashMap<KeyFrameId, usize>,

    /// Whether this plane was ever directly observed.
    pub seen: bool,

    pub ba_local_for_kf: Option<KeyFrameId>,
    pub ba_global_for_kf: Option<KeyFrameId>,

    /// Staged global BA estimate.
    pub plane_gba: Option<Plane3>,

    pub is_bad: bool,
}

impl MapPlane {
    pub fn new(id: MapPlaneId, plane: Plane3, seen: bool) -> Self {
        Self {
            id,
            plane,
            observations: HashMap::new(),
            not_seen_observations: HashMap::new(),
            parallel_observations: HashMap::new(),
            vertical_observations: HashMap::new(),
            seen,
            ba_local_for_kf: None,
            ba_global_for_kf: None,
            plane_gba: None,
            is_bad: false,
        }
    }

    pub fn observations(&self, relation: PlaneRelation) -> &HashMap<KeyFrameId, usize> {
        match relation {
            PlaneRelation::Seen => &self.observations,
            PlaneRelation::NotSeen => &self.not_seen_observations,
            PlaneRelation::Parallel => &self.parallel_observations,
            PlaneRelation::Vertical => &self.vertical_observations,
        }
    }

    fn observations_mut(&mut self, relation: PlaneRelation) -> &mut HashMap<KeyFrameId, usize> {
        match relation {
            PlaneRelation::Seen => &mut self.observations,
            PlaneRelation::NotSeen => &mut self.not_seen_observations,
            PlaneRelation::Parallel => &mut self.parallel_observations,
            PlaneRelation::Vertical => &mut self.vertical_observations,
        }
    }

    pub fn add_observation(&mut self, relation: PlaneRelation, kf_id: KeyFrameId, idx: usize) {
        if relation == PlaneRelation::Seen {
            self.seen = true;
        }
        self.observations_mut(relation).insert(kf_id, idx);
    }

    pub fn erase_observation(
        &mut self,
        relation: PlaneRelation,
        kf_id: KeyFrameId,
    ) -> Option<usize> {
        self.observations_mut(relation).remove(&kf_id)
    }

    /// Observations of one relation sorted by keyframe id.
    pub fn sorted_observations(&self, relation: PlaneRelation) -> Vec<(KeyFrameId, usize)> {
        let mut obs: Vec<(KeyFrameId, usize)> = self
            .observations(relation)
            .iter()
            .map(|(k, i)| (*k, *i))
            .collect();
        obs.sort();
        obs
    }

    pub fn num_observations(&self) -> usize {
        PlaneRelation::ALL
            .iter()
            .map(|r| self.observations(*r).len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_relations_are_independent() {
        let mut plane = MapPlane::new(MapPlaneId::new(1), Plane3::new(Vector3::z(), 0.0), false);
        plane.add_observation(PlaneRelation::Parallel, KeyFrameId::new(3), 0);
        plane.add_observation(PlaneRelation::NotSeen, KeyFrameId::new(3), 1);
        assert!(!plane.seen);

        plane.add_observation(PlaneRelation::Seen, KeyFrameId::new(4), 2);
        assert!(plane.seen);
        assert_eq!(plane.num_observations(), 3);

        assert_eq!(plane.erase_observation(PlaneRelation::NotSeen, KeyFrameId::new(3)), Some(1));
        assert_eq!(plane.observations(PlaneRelation::Parallel).len(), 1);
        assert_eq!(plane.erase_observation(PlaneRelation::Vertical, KeyFrameId::new(3)), None);
    }
}
