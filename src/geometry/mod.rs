//! Geometry primitives: rigid and similarity transforms, the pinhole camera,
//! planes, and ellipsoidal object landmarks.

pub mod camera;
pub mod ellipsoid;
pub mod plane;
pub mod se3;
pub mod sim3;

pub use camera::CameraIntrinsics;
pub use ellipsoid::{BoundingBox, Ellipse, Ellipsoid};
pub use plane::Plane3;
pub use se3::SE3;
pub use sim3::{Sim3, Sim3Tangent};
