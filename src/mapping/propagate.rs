//! Propagator: forward-warp the depth map into a newly promoted keyframe.
//!
//! Every valid pixel of the old keyframe is lifted to 3D with its smoothed
//! inverse depth, moved through the old → new relative pose, and deposited
//! at the nearest pixel of the new grid. Colliding hypotheses are either
//! merged (when consistent) or arbitrated by occlusion: the nearer surface
//! wins. Runs single-threaded because targets collide arbitrarily.

use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::warn;

use crate::frame::Frame;
use crate::geometry::sampling::interpolate;
use crate::settings::{
    DIFF_FAC_PROP_MERGE, MAX_DIFF_CONSTANT, MAX_DIFF_GRAD_MULT, VALIDITY_COUNTER_MAX,
    VALIDITY_COUNTER_MAX_VARIABLE,
};

use super::hypothesis::PixelHypothesis;
use super::DepthMap;

impl DepthMap {
    /// Warp `current` through the relative pose into `new_keyframe`'s grid
    /// (building it in `scratch`), then swap the grids.
    pub(crate) fn propagate_depth(&mut self, new_keyframe: &Frame) {
        let keyframe = self
            .active_keyframe
            .as_ref()
            .expect("propagate without active keyframe");

        if new_keyframe.tracking_parent() != Some(keyframe.id) {
            warn!(
                old_keyframe = keyframe.id,
                new_keyframe = new_keyframe.id,
                tracking_parent = ?new_keyframe.tracking_parent(),
                "propagating into a keyframe tracked on a different frame"
            );
        }

        for hypothesis in &mut self.scratch {
            *hypothesis = PixelHypothesis::invalid();
        }

        let old_to_new = new_keyframe.this_to_parent().se3().inverse();
        let rotation: Matrix3<f32> = old_to_new.rotation_matrix().cast();
        let translation: Vector3<f32> = old_to_new.translation.cast();

        // the quality mask only applies when the new keyframe was actually
        // tracked on the old one
        let use_mask = new_keyframe.tracking_parent() == Some(keyframe.id)
            && new_keyframe.has_tracking_quality_mask();

        let old_image = keyframe.image();
        let new_image = new_keyframe.image();
        let new_max_gradients = new_keyframe.max_gradients();

        let width = self.width;
        let height = self.height;
        let camera = &self.camera;
        let min_abs_grad = self.config.min_abs_grad_decrease;
        let current = &self.current;
        let scratch = &mut self.scratch;

        for y in 0..height {
            for x in 0..width {
                let source = current[x + y * width];
                if !source.is_valid {
                    continue;
                }

                let point_new = (rotation * camera.unproject(x as f32, y as f32))
                    / source.idepth_smoothed
                    + translation;
                let new_idepth = 1.0 / point_new.z;

                let u_new = point_new.x * new_idepth * camera.fx + camera.cx;
                let v_new = point_new.y * new_idepth * camera.fy + camera.cy;

                // outside the usable interior of the new image: drop
                if !(u_new > 2.1
                    && v_new > 2.1
                    && u_new < width as f32 - 3.1
                    && v_new < height as f32 - 3.1)
                {
                    continue;
                }

                let new_idx =
                    (u_new + 0.5) as usize + ((v_new + 0.5) as usize) * width;
                let dest_abs_grad = new_max_gradients[new_idx];

                if use_mask {
                    let good = new_keyframe.tracking_quality_at(x, y).unwrap_or(true);
                    if !good || dest_abs_grad < min_abs_grad {
                        continue;
                    }
                } else {
                    // no mask: substitute a photometric consistency check
                    let source_color = old_image[x + y * width];
                    let dest_color =
                        interpolate(new_image, &Vector2::new(u_new, v_new), width);
                    let residual = dest_color - source_color;

                    if residual * residual
                        / (MAX_DIFF_CONSTANT
                            + MAX_DIFF_GRAD_MULT * dest_abs_grad * dest_abs_grad)
                        > 1.0
                        || dest_abs_grad < min_abs_grad
                    {
                        continue;
                    }
                }

                let target = &mut scratch[new_idx];

                // nearer points gain variance, farther points lose it
                let ratio = new_idepth / source.idepth_smoothed;
                let idepth_ratio_4 = (ratio * ratio) * (ratio * ratio);
                let new_var = idepth_ratio_4 * source.idepth_var;

                if target.is_valid {
                    let diff = target.idepth - new_idepth;
                    if DIFF_FAC_PROP_MERGE * diff * diff > new_var + target.idepth_var {
                        // occlusion: the nearer surface wins
                        if new_idepth < target.idepth {
                            continue;
                        }
                        target.is_valid = false;
                    }
                }

                if !target.is_valid {
                    *target =
                        PixelHypothesis::new(new_idepth, new_var, source.validity_counter);
                } else {
                    let w = new_var / (target.idepth_var + new_var);
                    let merged_idepth = w * target.idepth + (1.0 - w) * new_idepth;

                    let cap = (VALIDITY_COUNTER_MAX + VALIDITY_COUNTER_MAX_VARIABLE) as i32;
                    let merged_validity =
                        (source.validity_counter + target.validity_counter).min(cap);

                    *target = PixelHypothesis::new(
                        merged_idepth,
                        1.0 / (1.0 / target.idepth_var + 1.0 / new_var),
                        merged_validity,
                    );
                }
            }
        }

        std::mem::swap(&mut self.current, &mut self.scratch);
    }
}
