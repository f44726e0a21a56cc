//! Constants and runtime configuration for the depth estimator.
//!
//! The constants encode the tuning of the stereo search, the fusion filter
//! and the regularizer. They are grouped by the stage that consumes them;
//! values that genuinely vary per deployment live in [`MappingConfig`].

/// Minimal scene depth tested for stereo. The far end of every search
/// bracket is `1 / MIN_DEPTH` in inverse depth.
pub const MIN_DEPTH: f32 = 0.05;

// ───────────────────────────────────────────────────────────────────────────
// Epipolar-line gates (pre-search well-posedness checks)
// ───────────────────────────────────────────────────────────────────────────

/// Squared minimal epipolar line length in the keyframe image.
pub const MIN_EPL_LENGTH_SQUARED: f32 = 1.0 * 1.0;

/// Squared minimal image gradient projected onto the epipolar direction.
pub const MIN_EPL_GRAD_SQUARED: f32 = 2.0 * 2.0;

/// Squared minimal cosine between the epipolar direction and the gradient.
pub const MIN_EPL_ANGLE_SQUARED: f32 = 0.3 * 0.3;

// ───────────────────────────────────────────────────────────────────────────
// Stereo search
// ───────────────────────────────────────────────────────────────────────────

/// Spacing of the 5 descriptor samples on the reference line, in pixels.
pub const REFERENCE_SAMPLE_DISTANCE: f32 = 1.0;

/// Margin a sample point must keep from the image border.
pub const SAMPLE_POINT_TO_BORDER: i32 = 7;

/// Searched line segments longer than this are cropped at the near end.
pub const MAX_EPL_LENGTH_CROP: f32 = 30.0;

/// Searched line segments shorter than this are padded symmetrically.
pub const MIN_EPL_LENGTH_CROP: f32 = 3.0;

/// Maximal SSD over the 5-sample descriptor for a match to count.
pub const MAX_ERROR_STEREO: f32 = 1300.0;

/// A non-adjacent second minimum closer than this factor to the best one
/// makes the match ambiguous.
pub const MIN_DISTANCE_ERROR_STEREO: f32 = 1.5;

/// Half-width of the search bracket in units of the prior standard
/// deviation: the bracket is `mean ± STEREO_EPL_VAR_FAC · σ`.
pub const STEREO_EPL_VAR_FAC: f32 = 2.0;

/// Guard against division by (near) zero.
pub const DIVISION_EPS: f32 = 1e-10;

// ───────────────────────────────────────────────────────────────────────────
// Variance handling
// ───────────────────────────────────────────────────────────────────────────

/// Prediction-step variance inflation applied before each fusion.
pub const SUCC_VAR_INC_FAC: f32 = 1.01;

/// Variance inflation applied after a failed or inconsistent observation.
pub const FAIL_VAR_INC_FAC: f32 = 1.1;

/// Hypotheses whose variance exceeds this are invalidated.
pub const MAX_VAR: f32 = 0.5 * 0.5;

/// Initial variance for random initialization.
pub const VAR_RANDOM_INIT_INITIAL: f32 = 0.5 * MAX_VAR;

/// Initial variance for ground-truth initialization.
pub const VAR_GT_INIT_INITIAL: f32 = 0.01 * 0.01;

// ───────────────────────────────────────────────────────────────────────────
// Validity and blacklisting
// ───────────────────────────────────────────────────────────────────────────

/// Fixed part of the per-pixel validity ceiling.
pub const VALIDITY_COUNTER_MAX: f32 = 5.0;

/// Gradient-dependent part of the validity ceiling; the full ceiling is
/// `VALIDITY_COUNTER_MAX + grad · VALIDITY_COUNTER_MAX_VARIABLE / 255`.
pub const VALIDITY_COUNTER_MAX_VARIABLE: f32 = 250.0;

/// Validity gained by a successful observation.
pub const VALIDITY_COUNTER_INC: i32 = 5;

/// Validity lost on an ambiguous observation.
pub const VALIDITY_COUNTER_DEC: i32 = 5;

/// Validity assigned to a hypothesis created by direct observation.
pub const VALIDITY_COUNTER_INITIAL_OBSERVE: i32 = 5;

/// Minimal 5×5 validity mass for the regularizer to keep a hypothesis.
pub const VAL_SUM_MIN_FOR_KEEP: i32 = 24;

/// Minimal 6×6 validity mass for the hole filler to seed a new hypothesis.
pub const VAL_SUM_MIN_FOR_CREATE: i32 = 30;

/// Validity mass above which even a blacklisted pixel is re-seeded.
pub const VAL_SUM_MIN_FOR_UNBLACKLIST: i32 = 100;

/// Pixels whose blacklist counter falls below this are never re-created.
pub const MIN_BLACKLIST: i32 = -1;

// ───────────────────────────────────────────────────────────────────────────
// Regularization and propagation
// ───────────────────────────────────────────────────────────────────────────

/// Assumed inverse-depth variance between direct neighbours; scales the
/// distance penalty of the 5×5 smoother.
pub const REG_DIST_VAR: f32 = 0.075 * 0.075;

/// Strictness of the smoother's neighbour-consistency test.
pub const DIFF_FAC_SMOOTHING: f32 = 1.0 * 1.0;

/// Strictness of the observation-consistency test in fusion.
pub const DIFF_FAC_OBSERVE: f32 = 1.0 * 1.0;

/// Strictness of the collision-consistency test in propagation.
pub const DIFF_FAC_PROP_MERGE: f32 = 1.0 * 1.0;

/// Constant part of the photometric propagation gate.
pub const MAX_DIFF_CONSTANT: f32 = 40.0 * 40.0;

/// Gradient-dependent part of the photometric propagation gate.
pub const MAX_DIFF_GRAD_MULT: f32 = 0.5 * 0.5;

/// Pyramid level of the tracking-quality mask (half resolution per level).
pub const TRACKING_QUALITY_LEVEL: usize = 1;

/// Replaces an exact zero by a tiny signed value so later divisions stay
/// finite.
#[inline]
pub fn unzero(value: f32) -> f32 {
    if value < 0.0 {
        value.min(-1e-10)
    } else {
        value.max(1e-10)
    }
}

/// Runtime configuration of the depth estimator.
#[derive(Debug, Clone)]
pub struct MappingConfig {
    /// Refine the SSD minimum to sub-sample precision.
    pub use_subpixel_stereo: bool,

    /// Accept matches whose triangulated inverse depth is negative.
    pub allow_negative_idepths: bool,

    /// Squared intensity noise of the camera, in (gray levels)².
    pub camera_pixel_noise_2: f32,

    /// Minimal max-gradient for a hypothesis to be created.
    pub min_abs_grad_create: f32,

    /// Minimal max-gradient for a hypothesis to survive.
    pub min_abs_grad_decrease: f32,

    /// Rows per parallel work strip.
    pub strip_height: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            use_subpixel_stereo: true,
            allow_negative_idepths: false,
            camera_pixel_noise_2: 4.0 * 4.0,
            min_abs_grad_create: 5.0,
            min_abs_grad_decrease: 5.0,
            strip_height: 10,
        }
    }
}
