//! Semi-dense probabilistic inverse-depth estimation for monocular SLAM.
//!
//! The crate maintains, for a designated *keyframe*, a per-pixel Gaussian
//! estimate of inverse depth. As tracked *reference frames* arrive with known
//! relative poses, the map is refined by epipolar-line stereo, fused with a
//! scalar Kalman update, spatially regularized and hole-filled. When a new
//! image is promoted to keyframe, the map is forward-warped through the
//! relative pose and re-normalized to mean inverse depth one.
//!
//! Entry point is [`mapping::DepthMap`]; the external collaborator it
//! operates on is [`frame::Frame`].

pub mod frame;
pub mod geometry;
pub mod mapping;
pub mod settings;
