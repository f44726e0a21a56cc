//! Geometry utilities: rigid/similarity transforms, camera intrinsics,
//! subpixel image sampling.

pub mod camera;
pub mod sampling;
pub mod se3;
pub mod sim3;

pub use camera::CameraModel;
pub use se3::SE3;
pub use sim3::Sim3;
