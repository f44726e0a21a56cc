//! Epipolar-line stereo: the per-pixel matching core.
//!
//! Given a keyframe pixel with a prior inverse-depth bracket and a prepared
//! reference frame, the search projects the bracket onto the reference
//! image, walks the resulting line segment with a 5-sample SSD descriptor,
//! optionally refines the minimum to sub-sample precision, and converts the
//! best correspondence back into an inverse depth with a variance derived
//! from the geometric and photometric error sources.

use nalgebra::{Vector2, Vector3};

use crate::frame::StereoPrep;
use crate::geometry::camera::homogeneous_projection;
use crate::geometry::sampling::{interpolate, interpolate_gradient};
use crate::geometry::CameraModel;
use crate::settings::{
    MappingConfig, DIVISION_EPS, MAX_EPL_LENGTH_CROP, MAX_ERROR_STEREO, MIN_DISTANCE_ERROR_STEREO,
    MIN_EPL_ANGLE_SQUARED, MIN_EPL_GRAD_SQUARED, MIN_EPL_LENGTH_CROP, MIN_EPL_LENGTH_SQUARED,
    REFERENCE_SAMPLE_DISTANCE, SAMPLE_POINT_TO_BORDER,
};

/// A successful epipolar match.
#[derive(Debug, Clone, Copy)]
pub struct StereoMatch {
    /// Inverse depth of the matched point, in the keyframe.
    pub idepth: f32,
    /// Estimated variance of `idepth`.
    pub variance: f32,
    /// Length of the searched segment before cropping, in reference pixels.
    pub epl_length: f32,
    /// SSD of the winning descriptor position.
    pub error: f32,
}

/// Outcome of one epipolar search. Failures are data, not errors: the
/// observer reacts to each kind differently.
#[derive(Debug, Clone, Copy)]
pub enum StereoOutcome {
    /// The search found an unambiguous minimum.
    Match(StereoMatch),
    /// Part of the search window leaves the image; worth retrying later.
    OutOfBounds,
    /// No clear winner (close second minimum, negative depth).
    Ambiguous,
    /// The best residual exceeds the photometric threshold.
    BigError,
    /// Degenerate geometry produced a non-finite line segment.
    Arithmetic,
    /// The epipolar-line gates rejected the pixel before the search.
    GateFailed,
}

/// Read-only inputs of one stereo probe.
pub(crate) struct StereoContext<'a> {
    pub camera: &'a CameraModel,
    pub width: usize,
    pub height: usize,
    pub key_image: &'a [f32],
    pub key_gradients: &'a [[f32; 2]],
    pub prep: &'a StereoPrep,
    pub ref_image: &'a [f32],
    pub initial_tracked_residual: f32,
    pub config: &'a MappingConfig,
}

#[inline]
fn in_image_range(point: &Vector2<f32>, width: usize, height: usize, padding: f32) -> bool {
    padding <= point.x
        && padding <= point.y
        && point.x <= (width - 1) as f32 - padding
        && point.y <= (height - 1) as f32 - padding
}

/// Full (not halved) central difference of the keyframe image.
#[inline]
fn image_gradient(image: &[f32], width: usize, x: i32, y: i32) -> Vector2<f32> {
    let idx = (x + y * width as i32) as usize;
    Vector2::new(
        image[idx + 1] - image[idx - 1],
        image[idx + width] - image[idx - width],
    )
}

#[inline]
fn cosine_angle_squared(a: &Vector2<f32>, b: &Vector2<f32>) -> f32 {
    let dot = a.dot(b);
    dot * dot / (a.norm_squared() * b.norm_squared() + DIVISION_EPS)
}

/// Build the epipolar direction at a keyframe pixel and apply the three
/// well-posedness gates: line length, gradient magnitude along the line,
/// and gradient-to-line angle. Returns the unit direction on success.
///
/// The line is the intersection of the keyframe image plane with the plane
/// spanned by both camera centers and the pixel ray,
/// `ℓ = t_z · (p − project(t))`, expanded so a baseline parallel to the
/// image plane (t_z = 0) stays finite.
pub(crate) fn make_and_check_epl(
    camera: &CameraModel,
    key_image: &[f32],
    width: usize,
    this_to_other_t: &Vector3<f32>,
    x: i32,
    y: i32,
) -> Option<Vector2<f32>> {
    let t = this_to_other_t;
    let epipolar_line = Vector2::new(
        -camera.fx * t.x + t.z * (x as f32 - camera.cx),
        -camera.fy * t.y + t.z * (y as f32 - camera.cy),
    );

    let length_squared = epipolar_line.norm_squared();
    if length_squared < MIN_EPL_LENGTH_SQUARED {
        return None;
    }

    let grad = image_gradient(key_image, width, x, y);

    let grad_projected = grad.dot(&epipolar_line);
    let epl_grad_squared = grad_projected * grad_projected / length_squared;
    if epl_grad_squared < MIN_EPL_GRAD_SQUARED {
        return None;
    }

    if cosine_angle_squared(&epipolar_line, &grad) < MIN_EPL_ANGLE_SQUARED {
        return None;
    }

    Some(epipolar_line / length_squared.sqrt())
}

/// Disparity error induced by pose/calibration noise: the tracking residual
/// scales the expected epipolar offset, which maps into disparity through
/// the gradient-to-line angle.
fn geometric_disparity_error(
    interpolated_gradient: &Vector2<f32>,
    epipolar_direction: &Vector2<f32>,
    initial_tracked_residual: f32,
) -> f32 {
    let tracking_error_fac = 0.25 * (1.0 + initial_tracked_residual);
    let p = epipolar_direction.dot(interpolated_gradient) + DIVISION_EPS;
    tracking_error_fac * tracking_error_fac * interpolated_gradient.norm_squared() / (p * p)
}

/// Squared intensity slope along the keyframe descriptor, normalized by the
/// sample interval.
fn grad_along_line(intensities: &[f32; 5], interval: f32) -> f32 {
    let mut sum = 0.0;
    for i in 0..4 {
        let d = intensities[i + 1] - intensities[i];
        sum += d * d;
    }
    sum / (interval * interval)
}

/// Search the reference epipolar line for the keyframe pixel (x, y).
///
/// `min_idepth ≤ prior_idepth ≤ max_idepth` bracket the inverse depth to
/// test; the prior determines the key-side sampling interval.
pub(crate) fn line_stereo(
    ctx: &StereoContext<'_>,
    x: i32,
    y: i32,
    min_idepth: f32,
    prior_idepth: f32,
    mut max_idepth: f32,
) -> StereoOutcome {
    let width = ctx.width;
    let prep = ctx.prep;

    let Some(epl_direction) =
        make_and_check_epl(ctx.camera, ctx.key_image, width, &prep.this_to_other_t, x, y)
    else {
        return StereoOutcome::GateFailed;
    };

    let key_coordinate = Vector2::new(x as f32, y as f32);
    let kinv_p = ctx.camera.unproject(x as f32, y as f32);

    // the prior fixes the ratio between key-side and reference-side sample
    // intervals; outside a moderate band the linear approximation breaks
    let p_ref = prep.k_other_to_this_r * (kinv_p / prior_idepth) + prep.k_other_to_this_t;
    let idepth_ref = 1.0 / p_ref.z;
    let inv_depth_ratio = prior_idepth / idepth_ref;
    let key_sample_distance = REFERENCE_SAMPLE_DISTANCE * inv_depth_ratio;

    let key_window = epl_direction * (2.0 * key_sample_distance);
    if !in_image_range(&(key_coordinate - key_window), width, ctx.height, 2.0)
        || !in_image_range(&(key_coordinate + key_window), width, ctx.height, 2.0)
    {
        return StereoOutcome::OutOfBounds;
    }

    if !(inv_depth_ratio > 0.7 && inv_depth_ratio < 1.4) {
        return StereoOutcome::OutOfBounds;
    }

    // project the bracket endpoints; clamp the near point in front of the
    // reference camera
    let mut p_close_3 = prep.k_other_to_this_r * kinv_p + prep.k_other_to_this_t * max_idepth;
    if p_close_3.z < 0.001 {
        let p_inf = prep.k_other_to_this_r * kinv_p;
        max_idepth = (0.001 - p_inf.z) / prep.k_other_to_this_t.z;
        p_close_3 = p_inf + prep.k_other_to_this_t * max_idepth;
    }
    let mut p_close = homogeneous_projection(&p_close_3);

    let p_far_3 = prep.k_other_to_this_r * kinv_p + prep.k_other_to_this_t * min_idepth;
    // the far point behind the camera, or an inverted bracket after the
    // clamp, means we moved past the point
    if p_far_3.z < 0.001 || max_idepth < min_idepth {
        return StereoOutcome::OutOfBounds;
    }
    let mut p_far = homogeneous_projection(&p_far_3);

    let segment = p_close - p_far;
    let epl_length = segment.norm();
    if !(epl_length > 0.0) || epl_length.is_infinite() {
        return StereoOutcome::Arithmetic;
    }
    let epl_unit = segment / epl_length;
    let ref_search_step = epl_unit * REFERENCE_SAMPLE_DISTANCE;

    if epl_length > MAX_EPL_LENGTH_CROP {
        p_close = p_far + epl_unit * MAX_EPL_LENGTH_CROP;
    }

    // extend one sample to each side
    p_far -= ref_search_step;
    p_close += ref_search_step;

    // pad short segments so the descriptor has something to discriminate
    if epl_length < MIN_EPL_LENGTH_CROP {
        let pad = (MIN_EPL_LENGTH_CROP - epl_length) / 2.0;
        p_far -= ref_search_step * pad;
        p_close += ref_search_step * pad;
    }

    let border = (SAMPLE_POINT_TO_BORDER + 1) as f32;
    if !in_image_range(&p_far, width, ctx.height, border)
        || !in_image_range(&p_close, width, ctx.height, border)
    {
        return StereoOutcome::OutOfBounds;
    }

    // key-side descriptor: 5 samples around the pixel along the line
    let key_step = epl_direction * key_sample_distance;
    let key_intensities: [f32; 5] = std::array::from_fn(|i| {
        let offset = i as f32 - 2.0;
        interpolate(ctx.key_image, &(key_coordinate + key_step * offset), width)
    });

    // rolling reference descriptor, advanced one sample per step
    let mut ref_intensities = [0.0f32; 5];
    for (i, value) in ref_intensities.iter_mut().take(4).enumerate() {
        let offset = i as f32 - 2.0;
        *value = interpolate(ctx.ref_image, &(p_far + ref_search_step * offset), width);
    }

    let mut search_point = p_far;
    let mut argmin_point = Vector2::new(-1.0f32, -1.0);
    let mut min_error = f32::INFINITY;
    let mut second_min_error = f32::INFINITY;

    // SSD and residual dot products of the samples neighbouring the winner,
    // kept for the sub-sample refinement
    let mut prev_error = f32::NAN;
    let mut next_error = f32::NAN;
    let mut prev_diff = f32::NAN;
    let mut next_diff = f32::NAN;
    let mut last_error = -1.0f32;

    // alternating residual buffers so the winner and its neighbour coexist
    let mut residuals_a = [0.0f32; 5];
    let mut residuals_b = [0.0f32; 5];

    let mut argmin: i32 = -1;
    let mut second_argmin: i32 = -1;

    let mut i: i32 = 0;
    loop {
        let passed_x = (ref_search_step.x < 0.0) != (search_point.x > p_close.x);
        let passed_y = (ref_search_step.y < 0.0) != (search_point.y > p_close.y);
        if passed_x || passed_y {
            break;
        }

        ref_intensities[4] = interpolate(
            ctx.ref_image,
            &(search_point + ref_search_step * 2.0),
            width,
        );

        let residuals: [f32; 5] =
            std::array::from_fn(|k| ref_intensities[k] - key_intensities[k]);
        if i % 2 == 0 {
            residuals_a = residuals;
        } else {
            residuals_b = residuals;
        }

        let error: f32 = residuals.iter().map(|e| e * e).sum();
        if error < min_error {
            second_min_error = min_error;
            second_argmin = argmin;

            min_error = error;
            argmin = i;
            argmin_point = search_point;

            prev_error = last_error;
            prev_diff = residuals_a
                .iter()
                .zip(&residuals_b)
                .map(|(a, b)| a * b)
                .sum();
            next_error = -1.0;
            next_diff = -1.0;
        } else {
            if i - 1 == argmin {
                next_error = error;
                next_diff = residuals_a
                    .iter()
                    .zip(&residuals_b)
                    .map(|(a, b)| a * b)
                    .sum();
            }
            if error < second_min_error {
                second_min_error = error;
                second_argmin = i;
            }
        }

        last_error = error;
        ref_intensities.copy_within(1..5, 0);
        search_point += ref_search_step;
        i += 1;
    }

    if min_error > 4.0 * MAX_ERROR_STEREO {
        return StereoOutcome::BigError;
    }

    // a non-adjacent runner-up of comparable error means the line is
    // ambiguous (repetitive texture)
    if (argmin - second_argmin).abs() > 1
        && MIN_DISTANCE_ERROR_STEREO * min_error > second_min_error
    {
        return StereoOutcome::Ambiguous;
    }

    // sub-sample refinement: model the SSD as piecewise linear in the
    // residuals; the half-gradient at the winner towards a neighbour is
    // e·e − e·e_neighbour, and the minimum sits at the zero crossing
    let mut did_interpolate = false;
    if ctx.config.use_subpixel_stereo {
        let grad_prev_prev = -(prev_error - prev_diff);
        let grad_prev_curr = min_error - prev_diff;
        let grad_next_curr = -(min_error - next_diff);
        let grad_next_next = next_error - next_diff;

        let prev_crossing = (grad_prev_prev < 0.0) != (grad_prev_curr < 0.0);
        let next_crossing = (grad_next_next < 0.0) != (grad_next_curr < 0.0);

        if prev_error < 0.0 || next_error < 0.0 {
            // winner at a walk boundary: one side has no neighbour
        } else if (grad_next_curr < 0.0) != (grad_prev_curr < 0.0) {
            // gradient flips inside the winning sample itself
        } else if prev_crossing && !next_crossing {
            let d = grad_prev_curr / (grad_prev_curr - grad_prev_prev);
            argmin_point -= ref_search_step * d;
            min_error = min_error - 2.0 * d * grad_prev_curr
                - (grad_prev_prev - grad_prev_curr) * d * d;
            did_interpolate = true;
        } else if next_crossing && !prev_crossing {
            let d = grad_next_curr / (grad_next_curr - grad_next_next);
            argmin_point += ref_search_step * d;
            min_error = min_error
                + 2.0 * d * grad_next_curr
                + (grad_next_next - grad_next_curr) * d * d;
            did_interpolate = true;
        }
    }

    let grad_along = grad_along_line(&key_intensities, key_sample_distance);

    // textured lines earn a larger error allowance
    if min_error > MAX_ERROR_STEREO + grad_along.sqrt() * 20.0 {
        return StereoOutcome::BigError;
    }

    // ── recover inverse depth in the keyframe ────────────────────────────
    // Two scalar equations relate the correspondence to the inverse depth;
    // the one driven by the dominant component of the search step is the
    // numerically stable choice.
    let r_kinv_p = prep.other_to_this_r * kinv_p;
    let t = &prep.other_to_this_t;
    let inv_cp = ctx.camera.unproject(argmin_point.x, argmin_point.y);

    let beta = Vector2::new(
        r_kinv_p.x * t.z - r_kinv_p.z * t.x,
        r_kinv_p.y * t.z - r_kinv_p.z * t.y,
    );
    let nominators = Vector2::new(
        inv_cp.x * t.z - inv_cp.z * t.x,
        inv_cp.y * t.z - inv_cp.z * t.y,
    );

    let use_x = ref_search_step.x * ref_search_step.x > ref_search_step.y * ref_search_step.y;
    let (idepth_new, alpha) = if use_x {
        (
            (r_kinv_p.x * inv_cp.z - r_kinv_p.z * inv_cp.x) / nominators.x,
            ref_search_step.x * ctx.camera.fxi * beta.x / (nominators.x * nominators.x),
        )
    } else {
        (
            (r_kinv_p.y * inv_cp.z - r_kinv_p.z * inv_cp.y) / nominators.y,
            ref_search_step.y * ctx.camera.fyi * beta.y / (nominators.y * nominators.y),
        )
    };

    if idepth_new < 0.0 && !ctx.config.allow_negative_idepths {
        return StereoOutcome::Ambiguous;
    }

    // ── variance: discretization + geometric + photometric ───────────────
    let interpolated_gradient = interpolate_gradient(ctx.key_gradients, &key_coordinate, width);
    let geo_error = geometric_disparity_error(
        &interpolated_gradient,
        &(epl_direction * REFERENCE_SAMPLE_DISTANCE),
        ctx.initial_tracked_residual,
    );
    let photo_error = 4.0 * ctx.config.camera_pixel_noise_2 / (grad_along + DIVISION_EPS);
    let discretization = if did_interpolate { 0.05 } else { 0.5 };

    let variance = alpha
        * alpha
        * (discretization * key_sample_distance * key_sample_distance + geo_error + photo_error);

    StereoOutcome::Match(StereoMatch {
        idepth: idepth_new,
        variance,
        epl_length,
        error: min_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::geometry::{CameraModel, Sim3, SE3};
    use crate::settings::{MappingConfig, MIN_DEPTH};
    use nalgebra::UnitQuaternion;

    const W: usize = 64;
    const H: usize = 64;

    fn camera() -> CameraModel {
        CameraModel::new(100.0, 100.0, 32.0, 32.0)
    }

    fn texture(px: f32, py: f32) -> f32 {
        128.0 + 60.0 * (10.0 * px).sin() + 60.0 * (10.0 * py).sin()
    }

    /// Fronto-parallel plane at `depth` (measured in the keyframe) textured
    /// with an analytic pattern; both views resample the same surface
    /// exactly, so there is no warping error in the test data.
    fn plane_image(cam: &CameraModel, depth: f32) -> Vec<f32> {
        let mut image = vec![0.0f32; W * H];
        for y in 0..H {
            for x in 0..W {
                let px = (x as f32 - cam.cx) * cam.fxi * depth;
                let py = (y as f32 - cam.cy) * cam.fyi * depth;
                image[x + y * W] = texture(px, py);
            }
        }
        image
    }

    /// Attach a reference frame to keyframe 0 with the given key → ref
    /// translation and run the stereo preparation.
    fn make_reference(image: Vec<f32>, key_to_ref_t: [f32; 3]) -> Frame {
        let cam = camera();
        let key_to_ref = SE3::new(
            UnitQuaternion::identity(),
            nalgebra::Vector3::new(
                key_to_ref_t[0] as f64,
                key_to_ref_t[1] as f64,
                key_to_ref_t[2] as f64,
            ),
        );
        let mut reference = Frame::new(1, W, H, image).unwrap();
        reference.set_tracking_parent(0, Sim3::from_se3(&key_to_ref.inverse()));
        reference.prepare_for_stereo(&reference.this_to_parent(), &cam);
        reference
    }

    /// Keyframe seeing a plane at depth 2, reference moved 0.1 towards it
    /// along the optical axis.
    fn z_translation_pair() -> (Frame, Frame) {
        let cam = camera();
        let key = Frame::new(0, W, H, plane_image(&cam, 2.0)).unwrap();
        // the same plane is 0.1 closer in the reference view; the lateral
        // plane coordinates are unchanged by a z translation
        let reference = make_reference(plane_image(&cam, 2.1), [0.0, 0.0, 0.1]);
        (key, reference)
    }

    fn probe(
        key: &Frame,
        reference: &Frame,
        x: i32,
        y: i32,
        bracket: (f32, f32, f32),
    ) -> StereoOutcome {
        let cam = camera();
        let config = MappingConfig::default();
        let prep = reference.stereo_prep().unwrap();
        let ctx = StereoContext {
            camera: &cam,
            width: W,
            height: H,
            key_image: key.image(),
            key_gradients: key.gradients(),
            prep: &prep,
            ref_image: reference.image(),
            initial_tracked_residual: 0.0,
            config: &config,
        };
        line_stereo(&ctx, x, y, bracket.0, bracket.1, bracket.2)
    }

    #[test]
    fn test_z_translation_recovers_plane_idepth() {
        let (key, reference) = z_translation_pair();

        // pixels in the textured annulus around the epipole, where both the
        // line-length and gradient-angle gates hold
        for &(x, y) in &[(48, 33), (33, 48), (47, 47), (18, 33), (33, 18)] {
            match probe(&key, &reference, x, y, (0.0, 1.0, 1.0 / MIN_DEPTH)) {
                StereoOutcome::Match(m) => {
                    assert!(
                        (m.idepth - 0.5).abs() < 0.1,
                        "pixel ({x},{y}) idepth {} not near 0.5",
                        m.idepth
                    );
                    assert!(m.variance > 0.0 && m.variance.is_finite());
                    assert!(m.epl_length > MIN_EPL_LENGTH_CROP);
                }
                other => panic!("pixel ({x},{y}) unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn test_aligned_gradient_pixels_beat_random_init_variance() {
        let (key, reference) = z_translation_pair();
        // main-diagonal pixels: gradient parallel to the radial epipolar
        // line, so the geometric error term is minimal
        let mut best_variance = f32::INFINITY;
        for &(x, y) in &[(47, 47), (45, 45), (17, 17), (19, 19)] {
            if let StereoOutcome::Match(m) =
                probe(&key, &reference, x, y, (0.0, 1.0, 1.0 / MIN_DEPTH))
            {
                best_variance = best_variance.min(m.variance);
            }
        }
        assert!(
            best_variance < crate::settings::VAR_RANDOM_INIT_INITIAL,
            "best variance {best_variance} not below the random-init level"
        );
    }

    #[test]
    fn test_flat_region_fails_epl_gates() {
        let cam = camera();
        let key = Frame::new(0, W, H, vec![100.0; W * H]).unwrap();
        let (_, reference) = z_translation_pair();

        let dir = make_and_check_epl(
            &cam,
            key.image(),
            W,
            &reference.stereo_prep().unwrap().this_to_other_t,
            48,
            33,
        );
        assert!(dir.is_none());

        assert!(matches!(
            probe(&key, &reference, 48, 33, (0.0, 1.0, 1.0 / MIN_DEPTH)),
            StereoOutcome::GateFailed
        ));
    }

    #[test]
    fn test_short_epl_near_epipole_fails_length_gate() {
        let (key, reference) = z_translation_pair();
        // 3 px from the epipole at the image center: |l|^2 = (0.1*3)^2 < 1
        assert!(matches!(
            probe(&key, &reference, 35, 32, (0.0, 1.0, 1.0 / MIN_DEPTH)),
            StereoOutcome::GateFailed
        ));
    }

    #[test]
    fn test_periodic_stripes_are_ambiguous() {
        // vertical stripes of period 4 px, so repeated SSD minima appear 4
        // search steps apart; the reference pattern is shifted a quarter
        // pixel so no alignment is exact and the equal minima stay non-zero
        let stripe = |x: f32| 128.0 + 80.0 * (std::f32::consts::PI * x / 2.0).sin();
        let mut key_image = vec![0.0f32; W * H];
        let mut ref_image = vec![0.0f32; W * H];
        for y in 0..H {
            for x in 0..W {
                key_image[x + y * W] = stripe(x as f32);
                ref_image[x + y * W] = stripe(x as f32 - 0.25);
            }
        }
        let key = Frame::new(0, W, H, key_image).unwrap();
        // sideways baseline: horizontal epipolar lines across the stripes
        let reference = make_reference(ref_image, [0.05, 0.0, 0.0]);

        assert!(matches!(
            probe(&key, &reference, 32, 20, (0.0, 1.0, 4.0)),
            StereoOutcome::Ambiguous
        ));
    }

    #[test]
    fn test_inverted_bracket_is_out_of_bounds() {
        let (key, reference) = z_translation_pair();
        assert!(matches!(
            probe(&key, &reference, 48, 33, (5.0, 1.0, 0.2)),
            StereoOutcome::OutOfBounds
        ));
    }
}
