//! Semi-dense depth estimation over an active keyframe.
//!
//! [`DepthMap`] owns the per-pixel hypothesis grids and drives the mapping
//! pipeline:
//!
//! - `update`: refine the map from tracked reference frames
//!   (observe → fill holes → regularize → publish),
//! - `promote`: carry the map into a new keyframe
//!   (propagate → regularize with occlusion removal → fill holes →
//!   regularize → re-normalize scale → publish),
//! - `finalize`: last publication plus the re-activation snapshot,
//! - the three initialization paths (random, ground truth, re-activation).
//!
//! Per-pixel sweeps run as parallel row strips; propagation is
//! single-threaded because its writes collide arbitrarily.

mod hypothesis;
mod observe;
mod propagate;
mod regularize;
mod stereo;
mod strips;
mod timing;

pub use hypothesis::PixelHypothesis;
pub use stereo::{StereoMatch, StereoOutcome};
pub use timing::{OpTimer, TimingStats};

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{ArcRwLockReadGuard, RawRwLock};
use rand::Rng;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::geometry::{CameraModel, Sim3};
use crate::settings::{
    MappingConfig, MIN_BLACKLIST, VAL_SUM_MIN_FOR_KEEP, VAR_GT_INIT_INITIAL,
    VAR_RANDOM_INIT_INITIAL,
};

use observe::ReferenceBatch;

/// Probabilistic inverse-depth map over the active keyframe.
pub struct DepthMap {
    width: usize,
    height: usize,
    camera: CameraModel,
    config: MappingConfig,

    /// The live hypothesis grid.
    current: Vec<PixelHypothesis>,
    /// Write target of regularization and propagation; swapped or copied,
    /// never reallocated.
    scratch: Vec<PixelHypothesis>,
    /// Integral image of validity counters for the hole filler.
    validity_integral: Vec<i32>,

    active_keyframe: Option<Arc<Frame>>,
    /// Scoped read guard keeping the keyframe's buffers alive.
    keyframe_lock: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
    /// Whether the active keyframe was restored from a snapshot rather than
    /// propagated; re-activated maps always observe against the newest
    /// reference.
    reactivated: bool,

    timing: TimingStats,
}

impl DepthMap {
    pub fn new(width: usize, height: usize, camera: CameraModel) -> Self {
        Self::with_config(width, height, camera, MappingConfig::default())
    }

    pub fn with_config(
        width: usize,
        height: usize,
        camera: CameraModel,
        config: MappingConfig,
    ) -> Self {
        Self {
            width,
            height,
            camera,
            config,
            current: vec![PixelHypothesis::invalid(); width * height],
            scratch: vec![PixelHypothesis::invalid(); width * height],
            validity_integral: vec![0; width * height],
            active_keyframe: None,
            keyframe_lock: None,
            reactivated: false,
            timing: TimingStats::new(),
        }
    }

    /// Whether a keyframe is currently active.
    pub fn is_valid(&self) -> bool {
        self.active_keyframe.is_some()
    }

    pub fn active_keyframe(&self) -> Option<&Arc<Frame>> {
        self.active_keyframe.as_ref()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// The live hypothesis grid, row-major.
    pub fn hypotheses(&self) -> &[PixelHypothesis] {
        &self.current
    }

    pub fn hypothesis_at(&self, x: usize, y: usize) -> &PixelHypothesis {
        &self.current[x + y * self.width]
    }

    pub fn timing(&self) -> &TimingStats {
        &self.timing
    }

    /// Invalidate both grids.
    pub fn reset(&mut self) {
        for hypothesis in self.current.iter_mut().chain(self.scratch.iter_mut()) {
            *hypothesis = PixelHypothesis::invalid();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────

    /// Seed random inverse depths in textured pixels of `keyframe`.
    pub fn init_from_random(&mut self, keyframe: &Arc<Frame>) {
        self.activate(keyframe, false);
        let max_gradients = keyframe.max_gradients();

        let mut rng = rand::thread_rng();
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                let idx = x + y * self.width;
                if max_gradients[idx] > self.config.min_abs_grad_create {
                    let idepth: f32 = rng.gen_range(0.5..1.5);
                    self.current[idx] = PixelHypothesis::new_smoothed(
                        idepth,
                        idepth,
                        VAR_RANDOM_INIT_INITIAL,
                        VAR_RANDOM_INIT_INITIAL,
                        20,
                    );
                } else {
                    self.current[idx] = PixelHypothesis::invalid();
                }
            }
        }

        keyframe.set_depth(&self.current);
    }

    /// Seed from the frame's externally known inverse depth.
    pub fn init_from_gt(&mut self, keyframe: &Arc<Frame>) {
        let gt = keyframe
            .gt_idepth()
            .expect("ground-truth init on a frame without idepth data");
        assert_eq!(gt.len(), self.width * self.height);

        for (hypothesis, &idepth) in self.current.iter_mut().zip(gt) {
            *hypothesis = if idepth.is_finite() && idepth > 0.0 {
                PixelHypothesis::new_smoothed(
                    idepth,
                    idepth,
                    VAR_GT_INIT_INITIAL,
                    VAR_GT_INIT_INITIAL,
                    20,
                )
            } else {
                PixelHypothesis::invalid()
            };
        }

        self.activate(keyframe, false);
        keyframe.set_depth(&self.current);
    }

    /// Rehydrate the map from a retired keyframe's snapshot.
    pub fn init_from_existing(&mut self, keyframe: &Arc<Frame>) {
        let data = keyframe
            .reactivation_data()
            .expect("re-activation on a frame without stored depth");

        self.activate(keyframe, true);
        keyframe.reset_mapping_stats();

        for i in 0..self.current.len() {
            let variance = data.idepth_var[i];
            if variance > 0.0 {
                self.current[i] =
                    PixelHypothesis::new(data.idepth[i], variance, data.validity[i] as i32);
            } else {
                let mut hypothesis = PixelHypothesis::invalid();
                // a −2 variance marks a pixel that was blacklisted when the
                // snapshot was taken
                if variance == -2.0 {
                    hypothesis.blacklisted = MIN_BLACKLIST - 1;
                }
                self.current[i] = hypothesis;
            }
        }

        self.regularize(false, VAL_SUM_MIN_FOR_KEEP);
    }

    fn activate(&mut self, keyframe: &Arc<Frame>, reactivated: bool) {
        assert_eq!(keyframe.width, self.width);
        assert_eq!(keyframe.height, self.height);
        self.keyframe_lock = Some(keyframe.hold_active());
        self.active_keyframe = Some(Arc::clone(keyframe));
        self.reactivated = reactivated;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle operations
    // ─────────────────────────────────────────────────────────────────────

    /// Refine the map with a batch of reference frames tracked on the
    /// active keyframe, ordered by ascending id.
    pub fn update(&mut self, reference_frames: &[Arc<Frame>]) {
        assert!(self.is_valid(), "update without an active keyframe");
        assert!(!reference_frames.is_empty(), "update with no references");
        let started_all = Instant::now();

        let keyframe = Arc::clone(self.active_keyframe.as_ref().unwrap());
        for frame in reference_frames {
            assert!(
                frame.tracking_parent().is_some(),
                "reference frame {} has no tracking parent",
                frame.id
            );
            if frame.tracking_parent() != Some(keyframe.id) {
                warn!(
                    keyframe = keyframe.id,
                    reference = frame.id,
                    tracking_parent = ?frame.tracking_parent(),
                    "updating with a reference tracked on a different frame"
                );
            }
            frame.prepare_for_stereo(&frame.this_to_parent(), &self.camera);
        }
        let batch = ReferenceBatch::new(reference_frames);

        let started = Instant::now();
        self.observe_depth(&batch);
        self.timing.observe.add(started);

        let started = Instant::now();
        self.regularize_fill_holes();
        self.timing.fill_holes.add(started);

        let started = Instant::now();
        self.regularize(false, VAL_SUM_MIN_FOR_KEEP);
        self.timing.regularize.add(started);

        if !keyframe.depth_has_been_updated() {
            let started = Instant::now();
            keyframe.set_depth(&self.current);
            self.timing.set_depth.add(started);
        }

        keyframe.note_mapped_on_this();
        self.timing.update.add(started_all);
    }

    /// Promote `new_keyframe` to active keyframe, carrying the map through
    /// the relative pose and re-normalizing the mean inverse depth to one.
    pub fn promote(&mut self, new_keyframe: &Arc<Frame>) {
        assert!(self.is_valid(), "promote without an active keyframe");
        assert!(
            new_keyframe.tracking_parent().is_some(),
            "promoted keyframe {} has no tracking parent",
            new_keyframe.id
        );
        let _hold = new_keyframe.hold_active();
        let started_all = Instant::now();

        let started = Instant::now();
        self.propagate_depth(new_keyframe);
        self.timing.propagate.add(started);

        self.activate(new_keyframe, false);

        let started = Instant::now();
        self.regularize(true, VAL_SUM_MIN_FOR_KEEP);
        self.timing.regularize.add(started);

        let started = Instant::now();
        self.regularize_fill_holes();
        self.timing.fill_holes.add(started);

        let started = Instant::now();
        self.regularize(false, VAL_SUM_MIN_FOR_KEEP);
        self.timing.regularize.add(started);

        // make the mean inverse depth one
        let mut idepth_sum = 0.0f32;
        let mut num_idepth = 0.0f32;
        for hypothesis in &self.current {
            if hypothesis.is_valid {
                idepth_sum += hypothesis.idepth_smoothed;
                num_idepth += 1.0;
            }
        }
        if num_idepth == 0.0 {
            warn!(
                keyframe = new_keyframe.id,
                "re-normalizing an empty depth map"
            );
        }
        let factor = num_idepth / idepth_sum;
        let factor_sq = factor * factor;
        for hypothesis in &mut self.current {
            if hypothesis.is_valid {
                hypothesis.idepth *= factor;
                hypothesis.idepth_smoothed *= factor;
                hypothesis.idepth_var *= factor_sq;
                hypothesis.idepth_var_smoothed *= factor_sq;
            }
        }

        // fold the inverse factor into the pose so world scale is preserved
        let parent_se3 = new_keyframe.this_to_parent().se3();
        new_keyframe.set_this_to_parent(Sim3::from_se3_with_scale(&parent_se3, factor as f64));

        let started = Instant::now();
        new_keyframe.set_depth(&self.current);
        self.timing.set_depth.add(started);

        self.timing.create.add(started_all);
    }

    /// Final smoothing pass, publication and re-activation snapshot before
    /// the keyframe is retired.
    pub fn finalize(&mut self) {
        assert!(self.is_valid(), "finalize without an active keyframe");
        let started_all = Instant::now();

        let started = Instant::now();
        self.regularize_fill_holes();
        self.timing.fill_holes.add(started);

        let started = Instant::now();
        self.regularize(false, VAL_SUM_MIN_FOR_KEEP);
        self.timing.regularize.add(started);

        let keyframe = Arc::clone(self.active_keyframe.as_ref().unwrap());
        let started = Instant::now();
        keyframe.set_depth(&self.current);
        keyframe.take_reactivation_data(&self.current);
        self.timing.set_depth.add(started);

        debug!(
            keyframe = keyframe.id,
            mean_information = keyframe.mean_information(),
            "finalized keyframe"
        );
        self.timing.finalize.add(started_all);
    }

    /// Release the active keyframe and its scoped lock.
    pub fn invalidate(&mut self) {
        if self.active_keyframe.is_none() {
            return;
        }
        self.active_keyframe = None;
        self.keyframe_lock = None;
    }

    /// Fold and report the per-operation timing EWMAs.
    pub fn add_timing_sample(&mut self) {
        self.timing.add_sample();
    }
}
