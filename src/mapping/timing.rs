//! Exponentially-weighted timing counters for the map operations.
//!
//! Each operation keeps an EWMA of its wall time and, once per second, an
//! EWMA of its rate. Diagnostics only; nothing reads these for correctness.

use std::time::Instant;

/// EWMA of one operation's duration and invocation rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpTimer {
    /// Smoothed duration in milliseconds.
    pub ms: f32,
    /// Invocations since the last rate sample.
    count: u32,
    /// Smoothed invocation rate in Hz.
    pub hz: f32,
}

impl OpTimer {
    /// Fold the time elapsed since `started` into the duration EWMA.
    pub(crate) fn add(&mut self, started: Instant) {
        let sample_ms = started.elapsed().as_secs_f32() * 1e3;
        self.ms = 0.9 * self.ms + 0.1 * sample_ms;
        self.count += 1;
    }

    fn fold_rate(&mut self, seconds: f32) {
        self.hz = 0.8 * self.hz + 0.2 * (self.count as f32 / seconds);
        self.count = 0;
    }
}

/// Timing counters for every stage of the estimator.
#[derive(Debug)]
pub struct TimingStats {
    pub update: OpTimer,
    pub create: OpTimer,
    pub finalize: OpTimer,
    pub observe: OpTimer,
    pub regularize: OpTimer,
    pub propagate: OpTimer,
    pub fill_holes: OpTimer,
    pub set_depth: OpTimer,
    last_rate_update: Instant,
}

impl TimingStats {
    pub fn new() -> Self {
        Self {
            update: OpTimer::default(),
            create: OpTimer::default(),
            finalize: OpTimer::default(),
            observe: OpTimer::default(),
            regularize: OpTimer::default(),
            propagate: OpTimer::default(),
            fill_holes: OpTimer::default(),
            set_depth: OpTimer::default(),
            last_rate_update: Instant::now(),
        }
    }

    /// Fold the per-second rates and report them; call once per mapping
    /// iteration.
    pub fn add_sample(&mut self) {
        let seconds = self.last_rate_update.elapsed().as_secs_f32();
        if seconds < 1.0 {
            return;
        }
        for timer in [
            &mut self.update,
            &mut self.create,
            &mut self.finalize,
            &mut self.observe,
            &mut self.regularize,
            &mut self.propagate,
            &mut self.fill_holes,
            &mut self.set_depth,
        ] {
            timer.fold_rate(seconds);
        }
        self.last_rate_update = Instant::now();

        tracing::debug!(
            update_ms = self.update.ms,
            update_hz = self.update.hz,
            create_ms = self.create.ms,
            create_hz = self.create.hz,
            finalize_ms = self.finalize.ms,
            finalize_hz = self.finalize.hz,
            observe_ms = self.observe.ms,
            regularize_ms = self.regularize.ms,
            propagate_ms = self.propagate.ms,
            fill_holes_ms = self.fill_holes.ms,
            set_depth_ms = self.set_depth.ms,
            "depth map timing"
        );
    }
}

impl Default for TimingStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accumulates_ewma() {
        let mut timer = OpTimer::default();
        timer.add(Instant::now());
        assert_eq!(timer.count, 1);
        assert!(timer.ms >= 0.0);
    }

    #[test]
    fn test_rate_fold_waits_a_full_second() {
        let mut stats = TimingStats::new();
        stats.update.add(Instant::now());
        stats.add_sample();
        // too early: the pending count must survive
        assert_eq!(stats.update.count, 1);
    }
}
