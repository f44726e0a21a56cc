//! Observer: per-pixel create/update sweep over the keyframe grid.
//!
//! For every sufficiently textured pixel the observer either creates a new
//! hypothesis from an unconstrained stereo search, or refines the existing
//! one from a search bracketed by the smoothed prior, fusing the result with
//! a scalar Kalman update. Failures feed the blacklist and validity
//! bookkeeping.

use std::sync::Arc;

use crate::frame::{Frame, StereoPrep};
use crate::geometry::CameraModel;
use crate::settings::{
    unzero, MappingConfig, DIFF_FAC_OBSERVE, FAIL_VAR_INC_FAC, MAX_VAR, MIN_BLACKLIST, MIN_DEPTH,
    MIN_EPL_LENGTH_CROP, STEREO_EPL_VAR_FAC, SUCC_VAR_INC_FAC, VALIDITY_COUNTER_DEC,
    VALIDITY_COUNTER_INC, VALIDITY_COUNTER_INITIAL_OBSERVE, VALIDITY_COUNTER_MAX,
    VALIDITY_COUNTER_MAX_VARIABLE,
};

use super::hypothesis::PixelHypothesis;
use super::stereo::{line_stereo, StereoContext, StereoOutcome};
use super::strips::par_row_strips;
use super::DepthMap;

/// Reference frames of one update call, indexable by frame id.
pub(crate) struct ReferenceBatch {
    /// One entry per id starting at `offset`; gaps are filled with the next
    /// younger frame so an id lookup always lands on a usable reference.
    by_id: Vec<(Arc<Frame>, StereoPrep)>,
    offset: i64,
}

impl ReferenceBatch {
    /// Build the id index. `frames` must be ordered by ascending id and
    /// already stereo-prepared.
    pub(crate) fn new(frames: &[Arc<Frame>]) -> Self {
        debug_assert!(!frames.is_empty());
        let offset = frames[0].id as i64;
        let mut by_id: Vec<(Arc<Frame>, StereoPrep)> = Vec::new();
        for frame in frames {
            let prep = frame
                .stereo_prep()
                .expect("reference frame not prepared for stereo");
            while by_id.len() as i64 + offset <= frame.id as i64 {
                by_id.push((Arc::clone(frame), prep.clone()));
            }
        }
        Self { by_id, offset }
    }

    fn oldest(&self) -> &(Arc<Frame>, StereoPrep) {
        self.by_id.first().expect("empty reference batch")
    }

    fn newest(&self) -> &(Arc<Frame>, StereoPrep) {
        self.by_id.last().expect("empty reference batch")
    }
}

struct ObserveContext<'a> {
    camera: &'a CameraModel,
    width: usize,
    height: usize,
    keyframe: &'a Frame,
    batch: &'a ReferenceBatch,
    reactivated: bool,
    config: &'a MappingConfig,
}

/// Scalar Kalman fusion of an observation into a prior, with the usual
/// prediction-step inflation. The posterior variance never exceeds the
/// prior: variance can only decrease from observation.
pub(crate) fn fuse_observation(
    prior_idepth: f32,
    prior_var: f32,
    observed_idepth: f32,
    observed_var: f32,
) -> (f32, f32) {
    let inflated_var = prior_var * SUCC_VAR_INC_FAC;
    let w = observed_var / (observed_var + inflated_var);
    let fused_idepth = (1.0 - w) * observed_idepth + w * prior_idepth;
    let fused_var = inflated_var * w;
    (
        unzero(fused_idepth),
        if fused_var < prior_var {
            fused_var
        } else {
            prior_var
        },
    )
}

impl DepthMap {
    /// One observation sweep over the interior of the keyframe grid.
    pub(crate) fn observe_depth(&mut self, batch: &ReferenceBatch) {
        let keyframe = Arc::clone(
            self.active_keyframe
                .as_ref()
                .expect("observe without active keyframe"),
        );
        let ctx = ObserveContext {
            camera: &self.camera,
            width: self.width,
            height: self.height,
            keyframe: &keyframe,
            batch,
            reactivated: self.reactivated,
            config: &self.config,
        };

        let width = self.width;
        let height = self.height;
        par_row_strips(
            &mut self.current,
            width,
            3,
            height - 3,
            self.config.strip_height,
            |y_start, y_end, strip| observe_rows(&ctx, y_start, y_end, strip),
        );
    }
}

fn observe_rows(ctx: &ObserveContext<'_>, y_start: usize, y_end: usize, strip: &mut [PixelHypothesis]) {
    let width = ctx.width;
    let max_gradients = ctx.keyframe.max_gradients();

    for y in y_start..y_end {
        for x in 3..width - 3 {
            let idx = x + y * width;
            let target = &mut strip[idx - y_start * width];
            let has_hypothesis = target.is_valid;

            // texture fell below the survival threshold
            if has_hypothesis && max_gradients[idx] < ctx.config.min_abs_grad_decrease {
                target.is_valid = false;
                continue;
            }

            if max_gradients[idx] < ctx.config.min_abs_grad_create
                || target.blacklisted < MIN_BLACKLIST
            {
                continue;
            }

            if !has_hypothesis {
                observe_create(ctx, target, x, y);
            } else {
                observe_update(ctx, target, x, y, max_gradients[idx]);
            }
        }
    }
}

/// First observation of a pixel: unconstrained search over the full depth
/// range.
fn observe_create(
    ctx: &ObserveContext<'_>,
    target: &mut PixelHypothesis,
    x: usize,
    y: usize,
) -> bool {
    let (ref_frame, prep) = if ctx.reactivated {
        ctx.batch.newest()
    } else {
        ctx.batch.oldest()
    };

    if ref_frame.tracking_parent() == Some(ctx.keyframe.id)
        && ref_frame.tracking_quality_at(x, y) == Some(false)
    {
        return false;
    }

    let stereo = StereoContext {
        camera: ctx.camera,
        width: ctx.width,
        height: ctx.height,
        key_image: ctx.keyframe.image(),
        key_gradients: ctx.keyframe.gradients(),
        prep,
        ref_image: ref_frame.image(),
        initial_tracked_residual: ref_frame.initial_tracked_residual(),
        config: ctx.config,
    };
    let outcome = line_stereo(&stereo, x as i32, y as i32, 0.0, 1.0, 1.0 / MIN_DEPTH);

    if matches!(outcome, StereoOutcome::Ambiguous | StereoOutcome::BigError) {
        target.blacklisted -= 1;
    }
    let StereoOutcome::Match(m) = outcome else {
        return false;
    };
    if m.variance > MAX_VAR {
        return false;
    }

    *target = PixelHypothesis::new(
        unzero(m.idepth),
        m.variance,
        VALIDITY_COUNTER_INITIAL_OBSERVE,
    );
    true
}

/// Re-observation of an existing hypothesis, bracketed by the smoothed
/// prior.
fn observe_update(
    ctx: &ObserveContext<'_>,
    target: &mut PixelHypothesis,
    x: usize,
    y: usize,
    abs_grad: f32,
) -> bool {
    let (ref_frame, prep) = if !ctx.reactivated {
        // each pixel walks its own window through the reference queue,
        // skipping ahead after short-baseline observations
        let relative = target.next_stereo_frame_min_id as i64 - ctx.batch.offset;
        if relative >= ctx.batch.by_id.len() as i64 {
            return false;
        }
        if relative < 0 {
            ctx.batch.oldest()
        } else {
            &ctx.batch.by_id[relative as usize]
        }
    } else {
        ctx.batch.newest()
    };

    if ref_frame.tracking_parent() == Some(ctx.keyframe.id)
        && ref_frame.tracking_quality_at(x, y) == Some(false)
    {
        return false;
    }

    let sigma = target.idepth_var_smoothed.sqrt();
    let min_idepth = (target.idepth_smoothed - sigma * STEREO_EPL_VAR_FAC).max(0.0);
    let max_idepth = (target.idepth_smoothed + sigma * STEREO_EPL_VAR_FAC).min(1.0 / MIN_DEPTH);

    let stereo = StereoContext {
        camera: ctx.camera,
        width: ctx.width,
        height: ctx.height,
        key_image: ctx.keyframe.image(),
        key_gradients: ctx.keyframe.gradients(),
        prep,
        ref_image: ref_frame.image(),
        initial_tracked_residual: ref_frame.initial_tracked_residual(),
        config: ctx.config,
    };
    let outcome = line_stereo(
        &stereo,
        x as i32,
        y as i32,
        min_idepth,
        target.idepth_smoothed,
        max_idepth,
    );

    match outcome {
        StereoOutcome::GateFailed => false,

        // still in bounds in the keyframe, so try again next frame
        StereoOutcome::OutOfBounds => false,

        StereoOutcome::Ambiguous => {
            target.validity_counter = (target.validity_counter - VALIDITY_COUNTER_DEC).max(0);
            target.next_stereo_frame_min_id = 0;
            target.idepth_var *= FAIL_VAR_INC_FAC;
            if target.idepth_var > MAX_VAR {
                target.is_valid = false;
                target.blacklisted -= 1;
            }
            false
        }

        StereoOutcome::BigError | StereoOutcome::Arithmetic => false,

        StereoOutcome::Match(m) => {
            let diff = m.idepth - target.idepth_smoothed;
            if DIFF_FAC_OBSERVE * diff * diff > m.variance + target.idepth_var_smoothed {
                // observation does not explain the prior: penalize
                target.idepth_var *= FAIL_VAR_INC_FAC;
                if target.idepth_var > MAX_VAR {
                    target.is_valid = false;
                }
                return false;
            }

            let (fused_idepth, fused_var) =
                fuse_observation(target.idepth, target.idepth_var, m.idepth, m.variance);
            target.idepth = fused_idepth;
            target.idepth_var = fused_var;

            target.validity_counter += VALIDITY_COUNTER_INC;
            let cap =
                VALIDITY_COUNTER_MAX + abs_grad * VALIDITY_COUNTER_MAX_VARIABLE / 255.0;
            if target.validity_counter as f32 > cap {
                target.validity_counter = cap as i32;
            }

            if m.epl_length < MIN_EPL_LENGTH_CROP {
                // baseline still short: skip ahead before re-observing
                let mut inc = ctx.keyframe.num_frames_tracked_on_this() as f32
                    / (ctx.keyframe.num_mapped_on_this() as f32 + 5.0);
                if inc < 3.0 {
                    inc = 3.0;
                }
                inc += ((m.epl_length * 10000.0) as i32 % 2) as f32;
                if m.epl_length < 0.5 * MIN_EPL_LENGTH_CROP {
                    inc *= 3.0;
                }
                target.next_stereo_frame_min_id = ref_frame.id as i32 + inc as i32;
            }
            true
        }
    }
}
