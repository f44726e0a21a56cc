//! Regularizer: neighbourhood smoothing and hole filling.
//!
//! The smoother writes the `*_smoothed` view of every hypothesis as an
//! inverse-variance weighted mean over its 5×5 neighbourhood, discarding
//! neighbours that disagree beyond their joint uncertainty (optionally
//! counting the nearer ones as occluders). The hole filler seeds new
//! hypotheses at textured invalid pixels whose surroundings carry enough
//! accumulated validity, measured through an integral image of the validity
//! counters.

use crate::settings::{
    unzero, DIFF_FAC_SMOOTHING, MIN_BLACKLIST, REG_DIST_VAR, VAL_SUM_MIN_FOR_CREATE,
    VAL_SUM_MIN_FOR_UNBLACKLIST, VAR_RANDOM_INIT_INITIAL,
};

use super::hypothesis::PixelHypothesis;
use super::strips::par_row_strips;
use super::DepthMap;

const REGULARIZE_RADIUS: i64 = 2;

impl DepthMap {
    /// Smooth the map: copy `current` into `scratch`, then rebuild the
    /// smoothed fields of `current` from the 5×5 neighbourhoods of the
    /// copy. Centers whose neighbourhood validity falls below
    /// `validity_threshold` are invalidated and blacklist-penalized; with
    /// `remove_occlusions`, centers dominated by nearer neighbours are
    /// invalidated too.
    pub(crate) fn regularize(&mut self, remove_occlusions: bool, validity_threshold: i32) {
        self.scratch.copy_from_slice(&self.current);

        let width = self.width;
        let height = self.height;
        let scratch = &self.scratch;
        par_row_strips(
            &mut self.current,
            width,
            REGULARIZE_RADIUS as usize,
            height - REGULARIZE_RADIUS as usize,
            self.config.strip_height,
            |y_start, y_end, strip| {
                regularize_rows(
                    scratch,
                    width,
                    remove_occlusions,
                    validity_threshold,
                    y_start,
                    y_end,
                    strip,
                );
            },
        );
    }

    /// Seed hypotheses at invalid, textured pixels surrounded by enough
    /// validity mass.
    pub(crate) fn regularize_fill_holes(&mut self) {
        self.build_validity_integral();
        self.scratch.copy_from_slice(&self.current);

        let keyframe = std::sync::Arc::clone(
            self.active_keyframe
                .as_ref()
                .expect("fill holes without active keyframe"),
        );
        let max_gradients = keyframe.max_gradients();
        let min_abs_grad = self.config.min_abs_grad_decrease;

        let width = self.width;
        let height = self.height;
        let scratch = &self.scratch;
        let integral = &self.validity_integral;
        par_row_strips(
            &mut self.current,
            width,
            3,
            height - 2,
            self.config.strip_height,
            |y_start, y_end, strip| {
                fill_holes_rows(
                    scratch,
                    integral,
                    max_gradients,
                    min_abs_grad,
                    width,
                    y_start,
                    y_end,
                    strip,
                );
            },
        );
    }

    /// Two-phase integral image of the validity counters: parallel row
    /// prefix sums, then a serial column accumulation.
    fn build_validity_integral(&mut self) {
        let width = self.width;
        let height = self.height;
        let current = &self.current;

        par_row_strips(
            &mut self.validity_integral,
            width,
            0,
            height,
            self.config.strip_height,
            |y_start, _, strip| {
                for (row_offset, row) in strip.chunks_mut(width).enumerate() {
                    let y = y_start + row_offset;
                    let mut sum = 0i32;
                    for (x, cell) in row.iter_mut().enumerate() {
                        let hypothesis = &current[x + y * width];
                        if hypothesis.is_valid {
                            sum += hypothesis.validity_counter;
                        }
                        *cell = sum;
                    }
                }
            },
        );

        for idx in width..width * height {
            self.validity_integral[idx] += self.validity_integral[idx - width];
        }
    }
}

fn regularize_rows(
    scratch: &[PixelHypothesis],
    width: usize,
    remove_occlusions: bool,
    validity_threshold: i32,
    y_start: usize,
    y_end: usize,
    strip: &mut [PixelHypothesis],
) {
    let radius = REGULARIZE_RADIUS;

    for y in y_start..y_end {
        for x in radius as usize..width - radius as usize {
            let idx = x + y * width;
            let center = &scratch[idx];
            let dest = &mut strip[idx - y_start * width];

            if !center.is_valid {
                continue;
            }

            let mut idepth_sum = 0.0f32;
            let mut ivar_sum = 0.0f32;
            let mut validity_sum = 0i32;
            let mut num_occluding = 0;
            let mut num_not_occluding = 0;

            for dx in -radius..=radius {
                for dy in -radius..=radius {
                    let source = &scratch[(idx as i64 + dx + dy * width as i64) as usize];
                    if !source.is_valid {
                        continue;
                    }

                    let diff = source.idepth - center.idepth;
                    if DIFF_FAC_SMOOTHING * diff * diff
                        > source.idepth_var + center.idepth_var
                    {
                        if remove_occlusions && source.idepth > center.idepth {
                            num_occluding += 1;
                        }
                        continue;
                    }

                    validity_sum += source.validity_counter;
                    if remove_occlusions {
                        num_not_occluding += 1;
                    }

                    let dist_fac = (dx * dx + dy * dy) as f32 * REG_DIST_VAR;
                    let ivar = 1.0 / (source.idepth_var + dist_fac);
                    idepth_sum += source.idepth * ivar;
                    ivar_sum += ivar;
                }
            }

            if validity_sum < validity_threshold {
                dest.is_valid = false;
                dest.blacklisted -= 1;
                continue;
            }

            if remove_occlusions && num_occluding > num_not_occluding {
                dest.is_valid = false;
                continue;
            }

            dest.idepth_smoothed = unzero(idepth_sum / ivar_sum);
            dest.idepth_var_smoothed = 1.0 / ivar_sum;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fill_holes_rows(
    scratch: &[PixelHypothesis],
    integral: &[i32],
    max_gradients: &[f32],
    min_abs_grad: f32,
    width: usize,
    y_start: usize,
    y_end: usize,
    strip: &mut [PixelHypothesis],
) {
    let w = width as i64;

    for y in y_start..y_end {
        for x in 3..width - 2 {
            let idx = x + y * width;
            let state = &scratch[idx];

            if state.is_valid || max_gradients[idx] < min_abs_grad {
                continue;
            }

            // validity mass of the surrounding window, from four integral
            // image corners
            let i = idx as i64;
            let mass = integral[(i + 2 + 2 * w) as usize]
                - integral[(i + 2 - 3 * w) as usize]
                - integral[(i - 3 + 2 * w) as usize]
                + integral[(i - 3 - 3 * w) as usize];

            let create = state.blacklisted >= MIN_BLACKLIST && mass > VAL_SUM_MIN_FOR_CREATE;
            let unblacklist = mass > VAL_SUM_MIN_FOR_UNBLACKLIST;
            if !(create || unblacklist) {
                continue;
            }

            // seed with the inverse-variance weighted mean of the valid
            // 5×5 neighbours
            let mut idepth_sum = 0.0f32;
            let mut ivar_sum = 0.0f32;
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    let source = &scratch[(i + dx + dy * w) as usize];
                    if !source.is_valid {
                        continue;
                    }
                    idepth_sum += source.idepth / source.idepth_var;
                    ivar_sum += 1.0 / source.idepth_var;
                }
            }

            let seed_idepth = unzero(idepth_sum / ivar_sum);
            strip[idx - y_start * width] =
                PixelHypothesis::new(seed_idepth, VAR_RANDOM_INIT_INITIAL, 0);
        }
    }
}
