//! Core ID types for the map registries.
//!
//! Ids are lightweight handles used for cross-referencing between keyframes,
//! landmarks, planes, and objects without shared ownership.

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a KeyFrame, assigned sequentially on creation.
    KeyFrameId,
    "KF"
);

entity_id!(
    /// Unique identifier for a 3D point landmark.
    MapPointId,
    "MP"
);

entity_id!(
    /// Unique identifier for a plane landmark. Seen and not-seen planes share
    /// the id space; which registry holds a plane decides its role.
    MapPlaneId,
    "PL"
);

entity_id!(
    /// Unique identifier for an object landmark.
    MapObjectId,
    "OB"
);

entity_id!(
    /// Identifier of the detection track that created an object. Object
    /// vertices in the optimizer are keyed by it.
    ObjectTrackId,
    "TR"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality_and_order() {
        let id1 = KeyFrameId::new(42);
        let id2 = KeyFrameId::new(42);
        let id3 = KeyFrameId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert!(id1 < id3);
    }

    #[test]
    fn test_id_display_prefixes() {
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", MapPlaneId::new(7)), "PL7");
        assert_eq!(format!("{}", ObjectTrackId::new(3)), "TR3");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<MapPlaneId, &str> = HashMap::new();
        map.insert(MapPlaneId::new(1), "floor");
        map.insert(MapPlaneId::new(2), "wall");

        assert_eq!(map.get(&MapPlaneId::new(1)), Some(&"floor"));
        assert_eq!(map.get(&MapPlaneId::new(3)), None);
    }
}
