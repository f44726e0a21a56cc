//! Per-pixel inverse-depth hypothesis.

/// One pixel's probabilistic inverse-depth estimate.
///
/// All numeric fields are meaningful only while `is_valid` is set; fusion
/// and regularization must not read them otherwise.
#[derive(Debug, Clone, Copy)]
pub struct PixelHypothesis {
    /// Whether this pixel currently carries an estimate.
    pub is_valid: bool,

    /// Decremented on hard stereo failures; once below the blacklist floor
    /// the pixel is never re-created.
    pub blacklisted: i32,

    /// Reference frames with an id below this are skipped when re-observing
    /// the pixel; raised after short-baseline observations.
    pub next_stereo_frame_min_id: i32,

    /// Reputation score accumulating successful observations.
    pub validity_counter: i32,

    /// Posterior mean of inverse depth.
    pub idepth: f32,
    /// Posterior variance of inverse depth.
    pub idepth_var: f32,

    /// Last regularized mean; −1 until the first smoothing pass.
    pub idepth_smoothed: f32,
    /// Last regularized variance; −1 until the first smoothing pass.
    pub idepth_var_smoothed: f32,
}

impl PixelHypothesis {
    /// An empty (invalid) hypothesis.
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            blacklisted: 0,
            next_stereo_frame_min_id: 0,
            validity_counter: 0,
            idepth: 0.0,
            idepth_var: 0.0,
            idepth_smoothed: 0.0,
            idepth_var_smoothed: 0.0,
        }
    }

    /// A fresh hypothesis; the smoothed fields stay unset until the next
    /// regularization pass.
    pub fn new(idepth: f32, idepth_var: f32, validity_counter: i32) -> Self {
        Self {
            is_valid: true,
            blacklisted: 0,
            next_stereo_frame_min_id: 0,
            validity_counter,
            idepth,
            idepth_var,
            idepth_smoothed: -1.0,
            idepth_var_smoothed: -1.0,
        }
    }

    /// A hypothesis with the smoothed view already filled in (seed paths).
    pub fn new_smoothed(
        idepth: f32,
        idepth_smoothed: f32,
        idepth_var: f32,
        idepth_var_smoothed: f32,
        validity_counter: i32,
    ) -> Self {
        Self {
            is_valid: true,
            blacklisted: 0,
            next_stereo_frame_min_id: 0,
            validity_counter,
            idepth,
            idepth_var,
            idepth_smoothed,
            idepth_var_smoothed,
        }
    }
}

impl Default for PixelHypothesis {
    fn default() -> Self {
        Self::invalid()
    }
}
