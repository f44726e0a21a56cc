//! Frame - one tracked camera image as seen by the depth estimator.
//!
//! A frame owns the level-0 intensity buffer together with the derived
//! gradient and max-gradient buffers, its pose relative to the tracking
//! parent, and the side data the estimator consumes or produces:
//!
//! - the per-reference stereo precomputation (`K·R`, `K·t`, `R`, `t` of the
//!   reference ← keyframe transform),
//! - the low-resolution tracking-quality mask filled by the tracker,
//! - the published smoothed depth (read by the tracker),
//! - the re-activation snapshot taken when a keyframe is retired.
//!
//! Image acquisition, undistortion and pyramid construction happen upstream;
//! this type only derives what stereo needs from the level-0 image.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use nalgebra::{Matrix3, Vector3};
use parking_lot::{ArcRwLockReadGuard, RawRwLock, RwLock};

use crate::geometry::{CameraModel, Sim3};
use crate::mapping::PixelHypothesis;
use crate::settings::{MIN_BLACKLIST, TRACKING_QUALITY_LEVEL};

/// Precomputed relative-pose products for epipolar stereo against the
/// active keyframe ("other" is the keyframe, "this" is the reference frame).
#[derive(Debug, Clone)]
pub struct StereoPrep {
    /// K · s · R, keyframe → reference.
    pub k_other_to_this_r: Matrix3<f32>,
    /// K · t, keyframe → reference.
    pub k_other_to_this_t: Vector3<f32>,
    /// R, keyframe → reference.
    pub other_to_this_r: Matrix3<f32>,
    /// t, keyframe → reference.
    pub other_to_this_t: Vector3<f32>,
    /// t, reference → keyframe; spans the epipolar plane in the keyframe.
    pub this_to_other_t: Vector3<f32>,
}

/// Smoothed depth published to the rest of the system after each map pass.
#[derive(Debug, Clone)]
pub struct PublishedDepth {
    /// Smoothed inverse depth per pixel; −1 where no estimate exists.
    pub idepth: Vec<f32>,
    /// Smoothed variance per pixel; −1 where no estimate exists.
    pub idepth_var: Vec<f32>,
    /// Number of pixels carrying an estimate.
    pub num_points: usize,
    /// Mean inverse depth over those pixels.
    pub mean_idepth: f32,
}

/// Snapshot stored when a keyframe is retired, sufficient to rebuild the
/// depth map if the keyframe is later re-activated.
#[derive(Debug, Clone)]
pub struct ReactivationData {
    pub idepth: Vec<f32>,
    /// Variance; −1 marks an invalid pixel, −2 a blacklisted one.
    pub idepth_var: Vec<f32>,
    pub validity: Vec<u8>,
}

/// A tracked camera image.
pub struct Frame {
    pub id: u32,
    pub width: usize,
    pub height: usize,

    image: Vec<f32>,
    /// Half central differences (gx, gy) per pixel; zero on the border.
    gradients: Vec<[f32; 2]>,
    /// Gradient magnitude, max-smeared over the 3×3 neighbourhood.
    max_gradients: Vec<f32>,

    tracking_parent: Option<u32>,
    this_to_parent: RwLock<Sim3>,
    initial_tracked_residual: f32,

    /// Per-pixel tracking quality at half resolution, filled by the tracker.
    tracking_quality: Option<Vec<bool>>,

    /// Externally supplied inverse depth (ground-truth initialization).
    gt_idepth: Option<Vec<f32>>,

    stereo_prep: RwLock<Option<StereoPrep>>,
    published: RwLock<Option<PublishedDepth>>,
    reactivation: RwLock<Option<ReactivationData>>,

    /// Guards the lifetime of the image/gradient buffers while a depth map
    /// is active on this frame; the estimator holds a read guard.
    active: Arc<RwLock<()>>,

    num_frames_tracked_on_this: AtomicU32,
    num_mapped_on_this: AtomicU32,
    num_mapped_on_this_total: AtomicU32,
    depth_updated: AtomicBool,
}

impl Frame {
    /// Build a frame from a level-0 intensity image, deriving the gradient
    /// and max-gradient buffers.
    pub fn new(id: u32, width: usize, height: usize, image: Vec<f32>) -> Result<Self> {
        ensure!(
            image.len() == width * height,
            "image buffer is {} values, expected {}x{}",
            image.len(),
            width,
            height
        );
        ensure!(
            width >= 16 && height >= 16,
            "image {}x{} too small for the stereo border margins",
            width,
            height
        );

        let gradients = build_gradients(&image, width, height);
        let max_gradients = build_max_gradients(&gradients, width, height);

        Ok(Self {
            id,
            width,
            height,
            image,
            gradients,
            max_gradients,
            tracking_parent: None,
            this_to_parent: RwLock::new(Sim3::identity()),
            initial_tracked_residual: 0.0,
            tracking_quality: None,
            gt_idepth: None,
            stereo_prep: RwLock::new(None),
            published: RwLock::new(None),
            reactivation: RwLock::new(None),
            active: Arc::new(RwLock::new(())),
            num_frames_tracked_on_this: AtomicU32::new(0),
            num_mapped_on_this: AtomicU32::new(0),
            num_mapped_on_this_total: AtomicU32::new(0),
            depth_updated: AtomicBool::new(false),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Construction-time setters (before the frame is shared)
    // ─────────────────────────────────────────────────────────────────────

    /// Record the frame this one was tracked on, and the relative pose
    /// this → parent.
    pub fn set_tracking_parent(&mut self, parent_id: u32, this_to_parent: Sim3) {
        self.tracking_parent = Some(parent_id);
        *self.this_to_parent.get_mut() = this_to_parent;
    }

    /// Residual of the initial tracking alignment; scales the geometric
    /// disparity error of stereo observations made from this frame.
    pub fn set_initial_tracked_residual(&mut self, residual: f32) {
        self.initial_tracked_residual = residual;
    }

    /// Attach the tracker's per-pixel quality mask (half resolution).
    pub fn set_tracking_quality_mask(&mut self, mask: Vec<bool>) {
        debug_assert_eq!(
            mask.len(),
            (self.width >> TRACKING_QUALITY_LEVEL) * (self.height >> TRACKING_QUALITY_LEVEL)
        );
        self.tracking_quality = Some(mask);
    }

    /// Attach externally known inverse depth (ground truth); NaN or
    /// non-positive entries mean "unknown".
    pub fn set_gt_idepth(&mut self, idepth: Vec<f32>) {
        debug_assert_eq!(idepth.len(), self.width * self.height);
        self.gt_idepth = Some(idepth);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Buffers and pose
    // ─────────────────────────────────────────────────────────────────────

    pub fn image(&self) -> &[f32] {
        &self.image
    }

    pub fn gradients(&self) -> &[[f32; 2]] {
        &self.gradients
    }

    pub fn max_gradients(&self) -> &[f32] {
        &self.max_gradients
    }

    pub fn tracking_parent(&self) -> Option<u32> {
        self.tracking_parent
    }

    pub fn this_to_parent(&self) -> Sim3 {
        self.this_to_parent.read().clone()
    }

    /// Overwrite the parent-relative pose (used when the promote step folds
    /// the depth re-normalization into the pose scale).
    pub fn set_this_to_parent(&self, pose: Sim3) {
        *self.this_to_parent.write() = pose;
    }

    pub fn initial_tracked_residual(&self) -> f32 {
        self.initial_tracked_residual
    }

    pub fn gt_idepth(&self) -> Option<&[f32]> {
        self.gt_idepth.as_deref()
    }

    /// Tracking quality of the full-resolution pixel (x, y), or `None` when
    /// the tracker supplied no mask.
    #[inline]
    pub fn tracking_quality_at(&self, x: usize, y: usize) -> Option<bool> {
        self.tracking_quality.as_ref().map(|mask| {
            let sub_width = self.width >> TRACKING_QUALITY_LEVEL;
            mask[(x >> TRACKING_QUALITY_LEVEL) + sub_width * (y >> TRACKING_QUALITY_LEVEL)]
        })
    }

    pub fn has_tracking_quality_mask(&self) -> bool {
        self.tracking_quality.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stereo preparation
    // ─────────────────────────────────────────────────────────────────────

    /// Precompute the pose products for stereo of this frame against the
    /// keyframe, given this → keyframe.
    pub fn prepare_for_stereo(&self, this_to_other: &Sim3, camera: &CameraModel) {
        let other_to_this = this_to_other.inverse();
        let k = camera.matrix();

        let r: Matrix3<f32> = other_to_this.rotation_matrix().cast();
        let t: Vector3<f32> = other_to_this.translation.cast();
        let scale = other_to_this.scale as f32;

        *self.stereo_prep.write() = Some(StereoPrep {
            k_other_to_this_r: k * r * scale,
            k_other_to_this_t: k * t,
            other_to_this_r: r,
            other_to_this_t: t,
            this_to_other_t: this_to_other.translation.cast(),
        });
    }

    pub fn stereo_prep(&self) -> Option<StereoPrep> {
        self.stereo_prep.read().clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Depth publication and re-activation
    // ─────────────────────────────────────────────────────────────────────

    /// Publish the smoothed depth of `hypotheses` on this frame.
    pub fn set_depth(&self, hypotheses: &[PixelHypothesis]) {
        debug_assert_eq!(hypotheses.len(), self.width * self.height);

        let mut idepth = vec![-1.0; hypotheses.len()];
        let mut idepth_var = vec![-1.0; hypotheses.len()];
        let mut sum = 0.0f32;
        let mut num = 0usize;

        for (i, h) in hypotheses.iter().enumerate() {
            if h.is_valid && h.idepth_smoothed >= -0.05 {
                idepth[i] = h.idepth_smoothed;
                idepth_var[i] = h.idepth_var_smoothed;
                sum += h.idepth_smoothed;
                num += 1;
            }
        }

        *self.published.write() = Some(PublishedDepth {
            idepth,
            idepth_var,
            num_points: num,
            mean_idepth: sum / num as f32,
        });
        self.depth_updated.store(true, Ordering::SeqCst);
    }

    pub fn published_depth(&self) -> Option<PublishedDepth> {
        self.published.read().clone()
    }

    /// Mean information 1/σ over the published estimates.
    pub fn mean_information(&self) -> f32 {
        let guard = self.published.read();
        let Some(published) = guard.as_ref() else {
            return 0.0;
        };
        let mut sum = 0.0f32;
        let mut num = 0usize;
        for &var in &published.idepth_var {
            if var > 0.0 {
                sum += 1.0 / var.sqrt();
                num += 1;
            }
        }
        if num == 0 {
            0.0
        } else {
            sum / num as f32
        }
    }

    /// Snapshot the raw (unsmoothed) map for later re-activation.
    pub fn take_reactivation_data(&self, hypotheses: &[PixelHypothesis]) {
        debug_assert_eq!(hypotheses.len(), self.width * self.height);

        let mut idepth = vec![0.0f32; hypotheses.len()];
        let mut idepth_var = vec![-1.0f32; hypotheses.len()];
        let mut validity = vec![0u8; hypotheses.len()];

        for (i, h) in hypotheses.iter().enumerate() {
            if h.is_valid {
                idepth[i] = h.idepth;
                idepth_var[i] = h.idepth_var;
                validity[i] = h.validity_counter.clamp(0, 255) as u8;
            } else if h.blacklisted < MIN_BLACKLIST {
                idepth_var[i] = -2.0;
            }
        }

        *self.reactivation.write() = Some(ReactivationData {
            idepth,
            idepth_var,
            validity,
        });
    }

    pub fn reactivation_data(&self) -> Option<ReactivationData> {
        self.reactivation.read().clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifetime and statistics
    // ─────────────────────────────────────────────────────────────────────

    /// Take a shared guard on this frame's active state. The depth map holds
    /// one for its whole tenure on the frame, keeping the buffers live.
    pub fn hold_active(&self) -> ArcRwLockReadGuard<RawRwLock, ()> {
        RwLock::read_arc(&self.active)
    }

    pub fn num_frames_tracked_on_this(&self) -> u32 {
        self.num_frames_tracked_on_this.load(Ordering::Relaxed)
    }

    /// Called by the tracker whenever a frame was tracked on this keyframe.
    pub fn note_tracked_on_this(&self) {
        self.num_frames_tracked_on_this
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_mapped_on_this(&self) -> u32 {
        self.num_mapped_on_this.load(Ordering::Relaxed)
    }

    pub fn note_mapped_on_this(&self) {
        self.num_mapped_on_this.fetch_add(1, Ordering::Relaxed);
        self.num_mapped_on_this_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_mapping_stats(&self) {
        self.num_mapped_on_this.store(0, Ordering::Relaxed);
        self.num_frames_tracked_on_this.store(0, Ordering::Relaxed);
    }

    /// Whether depth has been published and not yet consumed downstream.
    pub fn depth_has_been_updated(&self) -> bool {
        self.depth_updated.load(Ordering::SeqCst)
    }

    /// Downstream consumers call this after reading the published depth.
    pub fn clear_depth_updated(&self) {
        self.depth_updated.store(false, Ordering::SeqCst);
    }
}

/// Half central differences; the border ring stays zero.
fn build_gradients(image: &[f32], width: usize, height: usize) -> Vec<[f32; 2]> {
    let mut gradients = vec![[0.0f32; 2]; width * height];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = x + y * width;
            gradients[idx] = [
                0.5 * (image[idx + 1] - image[idx - 1]),
                0.5 * (image[idx + width] - image[idx - width]),
            ];
        }
    }
    gradients
}

/// Gradient magnitude max-smeared over 3×3, built separably (vertical max,
/// then horizontal max).
fn build_max_gradients(gradients: &[[f32; 2]], width: usize, height: usize) -> Vec<f32> {
    let magnitude: Vec<f32> = gradients
        .iter()
        .map(|g| (g[0] * g[0] + g[1] * g[1]).sqrt())
        .collect();

    let mut vertical_max = vec![0.0f32; width * height];
    for y in 1..height - 1 {
        for x in 0..width {
            let idx = x + y * width;
            vertical_max[idx] = magnitude[idx - width]
                .max(magnitude[idx])
                .max(magnitude[idx + width]);
        }
    }

    let mut max_gradients = vec![0.0f32; width * height];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = x + y * width;
            max_gradients[idx] = vertical_max[idx - 1]
                .max(vertical_max[idx])
                .max(vertical_max[idx + 1]);
        }
    }
    max_gradients
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_frame(width: usize, height: usize, slope: f32) -> Frame {
        let image: Vec<f32> = (0..width * height)
            .map(|i| (i % width) as f32 * slope)
            .collect();
        Frame::new(0, width, height, image).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_buffer_size() {
        assert!(Frame::new(0, 32, 32, vec![0.0; 100]).is_err());
    }

    #[test]
    fn test_gradients_of_horizontal_ramp() {
        let frame = ramp_frame(32, 32, 3.0);
        let idx = 10 + 10 * 32;
        assert_relative_eq!(frame.gradients()[idx][0], 3.0, epsilon = 1e-5);
        assert_relative_eq!(frame.gradients()[idx][1], 0.0, epsilon = 1e-5);
        assert_relative_eq!(frame.max_gradients()[idx], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_max_gradient_smears_over_neighbourhood() {
        // single bright pixel: the magnitude peak spreads to the 3x3 ring
        let mut image = vec![0.0f32; 32 * 32];
        image[16 + 16 * 32] = 100.0;
        let frame = Frame::new(0, 32, 32, image).unwrap();
        let center = 16 + 16 * 32;
        assert!(frame.max_gradients()[center + 1] > 0.0);
        assert!(frame.max_gradients()[center + 32] > 0.0);
    }

    #[test]
    fn test_tracking_quality_lookup_is_subsampled() {
        let mut frame = ramp_frame(32, 32, 1.0);
        let mut mask = vec![true; 16 * 16];
        mask[5 + 16 * 7] = false;
        frame.set_tracking_quality_mask(mask);

        assert_eq!(frame.tracking_quality_at(10, 14), Some(false));
        assert_eq!(frame.tracking_quality_at(11, 15), Some(false));
        assert_eq!(frame.tracking_quality_at(12, 14), Some(true));
    }

    #[test]
    fn test_mapping_counters() {
        let frame = ramp_frame(32, 32, 1.0);
        frame.note_tracked_on_this();
        frame.note_tracked_on_this();
        frame.note_mapped_on_this();
        assert_eq!(frame.num_frames_tracked_on_this(), 2);
        assert_eq!(frame.num_mapped_on_this(), 1);

        frame.reset_mapping_stats();
        assert_eq!(frame.num_frames_tracked_on_this(), 0);
        assert_eq!(frame.num_mapped_on_this(), 0);
    }

    #[test]
    fn test_set_depth_publishes_smoothed_estimates() {
        use crate::mapping::PixelHypothesis;

        let frame = ramp_frame(32, 32, 1.0);
        let mut hypotheses = vec![PixelHypothesis::invalid(); 32 * 32];
        hypotheses[100] = PixelHypothesis::new_smoothed(0.5, 0.4, 0.01, 0.04, 10);
        hypotheses[101] = PixelHypothesis::new(0.5, 0.01, 10); // not yet smoothed

        frame.set_depth(&hypotheses);
        assert!(frame.depth_has_been_updated());

        let published = frame.published_depth().unwrap();
        assert_eq!(published.num_points, 1);
        assert_relative_eq!(published.idepth[100], 0.4);
        assert_relative_eq!(published.idepth_var[100], 0.04);
        assert_relative_eq!(published.idepth[101], -1.0); // smoothed field unset
        assert_relative_eq!(frame.mean_information(), 1.0 / 0.04f32.sqrt());

        frame.clear_depth_updated();
        assert!(!frame.depth_has_been_updated());
    }

    #[test]
    fn test_prepare_for_stereo_identity_pose() {
        let camera = CameraModel::new(100.0, 100.0, 16.0, 16.0);
        let frame = ramp_frame(32, 32, 1.0);
        frame.prepare_for_stereo(&Sim3::identity(), &camera);

        let prep = frame.stereo_prep().unwrap();
        assert_relative_eq!(prep.k_other_to_this_t.norm(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(
            prep.k_other_to_this_r,
            camera.matrix(),
            epsilon = 1e-5
        );
    }
}
