//! Keyframe promotion decision.
//!
//! After coarse tracking, a frame is promoted when the observed optical flow
//! and brightness change are large enough, when tracking quality degraded
//! against the reference, or on a timer. A fractional minimum-spacing rule
//! is enforced with an accumulator.

use crate::settings::Settings;

/// Inputs to the promotion predicate for one tracked frame.
#[derive(Debug, Clone)]
pub struct KeyframeInputs {
    /// Number of frames in the history including this one.
    pub history_len: usize,
    /// Timestamp of this frame, seconds.
    pub timestamp: f64,
    /// Timestamp of the newest keyframe.
    pub last_kf_timestamp: f64,
    /// Tracker outputs: `[rmse, flow_t, flow_r, flow_rt]`.
    pub tres: [f64; 4],
    /// Brightness gain between the reference keyframe and this frame.
    pub ref_to_fh_a: f64,
    /// First RMSE achieved against the current reference.
    pub first_coarse_rmse: f64,
    /// Force promotion (all-NaN residuals in inertial mode).
    pub force_kf: bool,
    /// Image width plus height at level 0.
    pub w_plus_h: f64,
}

/// Stateful keyframe decision; owns the fractional spacing accumulator.
#[derive(Debug, Default)]
pub struct KeyframeDecision {
    frames_between_kfs_rest: f64,
}

impl KeyframeDecision {
    pub fn new() -> Self {
        Self::default()
    }

    /// The promotion predicate.
    pub fn needs_keyframe(&self, settings: &Settings, inp: &KeyframeInputs) -> bool {
        if settings.keyframes_per_second > 0.0 {
            return inp.history_len == 1
                || (inp.timestamp - inp.last_kf_timestamp)
                    > 0.95 / settings.keyframes_per_second;
        }

        let time_since_last_kf = inp.timestamp - inp.last_kf_timestamp;
        let flow = settings.kf_global_weight * settings.max_shift_weight_t * inp.tres[1].sqrt()
            / inp.w_plus_h
            + settings.kf_global_weight * settings.max_shift_weight_r * inp.tres[2].sqrt()
                / inp.w_plus_h
            + settings.kf_global_weight * settings.max_shift_weight_rt * inp.tres[3].sqrt()
                / inp.w_plus_h
            + settings.kf_global_weight * settings.max_affine_weight * inp.ref_to_fh_a.ln().abs();

        inp.history_len == 1
            || flow > 1.0
            || 2.0 * inp.first_coarse_rmse < inp.tres[0]
            || (settings.max_time_between_keyframes > 0.0
                && time_since_last_kf > settings.max_time_between_keyframes)
            || inp.force_kf
    }

    /// Enforce the minimum inter-keyframe spacing. Returns false when the
    /// promotion must be skipped. Fractional settings are honored by
    /// accumulating the fractional part and skipping once it reaches one.
    pub fn enforce_min_spacing(&mut self, settings: &Settings, frames_between_kfs: i64) -> bool {
        let min = settings.min_frames_between_keyframes;
        if (frames_between_kfs as f64) < min.floor() {
            return false;
        }
        if (frames_between_kfs as f64) < min {
            let fractional = min - min.floor();
            self.frames_between_kfs_rest += fractional;
            if self.frames_between_kfs_rest >= 1.0 {
                self.frames_between_kfs_rest -= 1.0;
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> KeyframeInputs {
        KeyframeInputs {
            history_len: 50,
            timestamp: 10.0,
            last_kf_timestamp: 9.9,
            tres: [1.0, 0.0, 0.0, 0.0],
            ref_to_fh_a: 1.0,
            first_coarse_rmse: 1.0,
            force_kf: false,
            w_plus_h: 640.0 + 480.0,
        }
    }

    #[test]
    fn test_static_scene_is_not_promoted() {
        let settings = Settings::default();
        let d = KeyframeDecision::new();
        assert!(!d.needs_keyframe(&settings, &base_inputs()));
    }

    #[test]
    fn test_large_flow_promotes() {
        let settings = Settings::default();
        let d = KeyframeDecision::new();
        let mut inp = base_inputs();
        // flow_t of (w+h)^2 pixels^2 saturates the translation criterion.
        inp.tres[1] = (inp.w_plus_h / settings.max_shift_weight_t).powi(2);
        assert!(d.needs_keyframe(&settings, &inp));
    }

    #[test]
    fn test_exposure_jump_promotes() {
        let settings = Settings::default();
        let d = KeyframeDecision::new();
        let mut inp = base_inputs();
        inp.ref_to_fh_a = 2.0; // |ln 2| * 2 > 1
        assert!(d.needs_keyframe(&settings, &inp));
    }

    #[test]
    fn test_rmse_doubling_promotes() {
        let settings = Settings::default();
        let d = KeyframeDecision::new();
        let mut inp = base_inputs();
        inp.first_coarse_rmse = 1.0;
        inp.tres[0] = 2.5;
        assert!(d.needs_keyframe(&settings, &inp));
    }

    #[test]
    fn test_fixed_rate_mode() {
        let mut settings = Settings::default();
        settings.keyframes_per_second = 2.0;
        let d = KeyframeDecision::new();
        let mut inp = base_inputs();
        inp.timestamp = inp.last_kf_timestamp + 0.3;
        assert!(!d.needs_keyframe(&settings, &inp));
        inp.timestamp = inp.last_kf_timestamp + 0.5;
        assert!(d.needs_keyframe(&settings, &inp));
    }

    #[test]
    fn test_time_limit_promotes() {
        let mut settings = Settings::default();
        settings.max_time_between_keyframes = 0.5;
        let d = KeyframeDecision::new();
        let mut inp = base_inputs();
        inp.timestamp = inp.last_kf_timestamp + 0.6;
        assert!(d.needs_keyframe(&settings, &inp));
    }

    #[test]
    fn test_min_spacing_integer() {
        let mut settings = Settings::default();
        settings.min_frames_between_keyframes = 2.0;
        let mut d = KeyframeDecision::new();
        assert!(!d.enforce_min_spacing(&settings, 0));
        assert!(!d.enforce_min_spacing(&settings, 1));
        assert!(d.enforce_min_spacing(&settings, 2));
    }

    #[test]
    fn test_min_spacing_fractional_accumulator() {
        let mut settings = Settings::default();
        settings.min_frames_between_keyframes = 1.5;
        let mut d = KeyframeDecision::new();
        // Spacing of exactly 1 frame: the 0.5 excess accumulates and every
        // second promotion is skipped.
        assert!(d.enforce_min_spacing(&settings, 1)); // rest = 0.5
        assert!(!d.enforce_min_spacing(&settings, 1)); // rest hits 1.0, skip
        assert!(d.enforce_min_spacing(&settings, 1)); // rest = 0.5 again
    }
}
