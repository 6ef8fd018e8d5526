//! Process-wide configuration record.
//!
//! All tunables are gathered in a single [`Settings`] struct that is built
//! once at startup and then shared immutably (`Arc<Settings>`) between the
//! tracking and mapping threads. No component mutates it after construction.

/// Configuration for the odometry front-end.
///
/// Field groups follow the pipeline stages: threading model, keyframe
/// management, coarse tracking, immature-point tracing, photometric residual
/// weighting, point lifecycle, and diagnostics.
#[derive(Debug, Clone)]
pub struct Settings {
    // ── threading / mode ────────────────────────────────────────────────
    /// Use inertial measurements (enables the pose-hint path and the
    /// IMU trust override during coarse tracking).
    pub use_imu: bool,
    /// Deterministic mode: the tracking thread performs mapping inline
    /// instead of handing frames to the mapping worker.
    pub linearize_operation: bool,
    /// In real-time mode, make every delivered frame a keyframe.
    pub real_time_max_kf: bool,

    // ── map density ─────────────────────────────────────────────────────
    /// Target number of active points in the optimization window.
    pub desired_point_density: f32,
    /// Target number of immature candidate points per keyframe.
    pub desired_immature_num: i32,
    /// Maximum number of keyframes in the active window.
    pub max_frames: usize,

    // ── keyframe decision ───────────────────────────────────────────────
    /// Minimum frames between keyframes; fractional values are enforced
    /// with an accumulator.
    pub min_frames_between_keyframes: f64,
    /// If positive, promote keyframes at this fixed rate and ignore the
    /// flow-based predicate.
    pub keyframes_per_second: f64,
    /// If positive, force a keyframe when this much time passed since the
    /// last one.
    pub max_time_between_keyframes: f64,
    /// In IMU mode, suppress promotion when the scale-corrected translation
    /// is below this threshold.
    pub force_no_kf_translation_thresh: f64,
    /// Global weight on the optical-flow keyframe criterion.
    pub kf_global_weight: f64,
    /// Weight of the translation-only flow indicator.
    pub max_shift_weight_t: f64,
    /// Weight of the rotation-only flow indicator.
    pub max_shift_weight_r: f64,
    /// Weight of the combined flow indicator.
    pub max_shift_weight_rt: f64,
    /// Weight of the exposure-ratio term.
    pub max_affine_weight: f64,
    /// Stop trying pose candidates once the achieved residual is below
    /// `last_rmse * re_track_threshold`.
    pub re_track_threshold: f64,

    // ── immature point tracing ──────────────────────────────────────────
    /// Step size of the discrete epipolar search, in pixels.
    pub trace_stepsize: f32,
    /// Skip the trace when the projected interval is shorter than this.
    pub trace_slack_interval: f32,
    /// Required ratio between interval length and attainable accuracy.
    pub trace_min_improvement_factor: f32,
    /// Maximum Gauss-Newton refinement iterations along the epipolar line.
    pub trace_gn_iterations: i32,
    /// Stop GN refinement once the accepted step is below this.
    pub trace_gn_threshold: f32,
    /// Slack factor on the energy threshold for the outlier check.
    pub trace_extra_slack_on_th: f32,
    /// Radius (in search steps) excluded around the best match when
    /// computing the second-best energy.
    pub min_trace_test_radius: i32,
    /// Minimum best/second-best quality ratio required for activation.
    pub min_trace_quality: f32,
    /// Maximum epipolar search length as a fraction of (width + height).
    pub max_pix_search: f32,

    // ── photometric residuals ───────────────────────────────────────────
    /// Huber threshold on photometric residuals.
    pub huber_th: f32,
    /// Per-pattern-pixel outlier energy threshold.
    pub outlier_th: f32,
    /// Gradient-dependent weighting constant.
    pub outlier_th_sum_component: f32,
    /// Global scale on the per-point energy threshold.
    pub overall_energy_th_weight: f32,

    // ── point lifecycle ─────────────────────────────────────────────────
    /// Points with scaled inverse depth below this are dropped.
    pub min_idepth: f32,
    /// Minimum inverse-depth precision required to marginalize (rather
    /// than drop) a point.
    pub min_idepth_h_marg: f32,
    /// Minimum inverse-depth Hessian required during activation.
    pub min_idepth_h_act: f32,
    /// GN iterations when optimizing an immature point for activation.
    pub gn_its_on_point_activation: i32,
    /// Minimum active residuals for a point to be considered for
    /// marginalization rather than dropping.
    pub min_good_active_res_for_marg: usize,
    /// Minimum accumulated good residuals for inlier classification.
    pub min_good_res_for_marg: u32,

    // ── frame marginalization ───────────────────────────────────────────
    /// Fraction of remaining points below which a frame is flagged.
    pub min_points_remaining: f32,
    /// Maximum tolerated log affine brightness factor inside the window.
    pub max_log_aff_fac_in_window: f32,
    /// Keyframes younger than this are never flagged by the distance score.
    pub min_frame_age: i64,
    /// Never flag below this many frames in the window.
    pub min_frames: usize,

    // ── window optimization ─────────────────────────────────────────────
    /// Iteration budget handed to the backend per keyframe.
    pub max_opt_iterations: usize,

    // ── initialization ──────────────────────────────────────────────────
    /// Abort initialization when the time since the first initializer
    /// frame exceeds this (seconds).
    pub max_time_between_init_frames: f64,
    /// Slack on the RMSE thresholds used to detect a failed initialization.
    pub benchmark_initializer_slack_factor: f32,

    // ── diagnostics ─────────────────────────────────────────────────────
    /// Write diagnostic log files.
    pub log_stuff: bool,
    /// Suppress per-frame console chatter.
    pub debugout_runquiet: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_imu: false,
            linearize_operation: true,
            real_time_max_kf: false,

            desired_point_density: 2000.0,
            desired_immature_num: 1500,
            max_frames: 7,

            min_frames_between_keyframes: 0.0,
            keyframes_per_second: 0.0,
            max_time_between_keyframes: 0.0,
            force_no_kf_translation_thresh: 0.0,
            kf_global_weight: 1.0,
            max_shift_weight_t: 0.04,
            max_shift_weight_r: 0.0,
            max_shift_weight_rt: 0.02,
            max_affine_weight: 2.0,
            re_track_threshold: 1.5,

            trace_stepsize: 1.0,
            trace_slack_interval: 1.5,
            trace_min_improvement_factor: 2.0,
            trace_gn_iterations: 3,
            trace_gn_threshold: 0.1,
            trace_extra_slack_on_th: 1.2,
            min_trace_test_radius: 2,
            min_trace_quality: 3.0,
            max_pix_search: 0.027,

            huber_th: 9.0,
            outlier_th: 12.0 * 12.0,
            outlier_th_sum_component: 50.0 * 50.0,
            overall_energy_th_weight: 1.0,

            min_idepth: 0.02,
            min_idepth_h_marg: 50.0,
            min_idepth_h_act: 100.0,
            gn_its_on_point_activation: 3,
            min_good_active_res_for_marg: 3,
            min_good_res_for_marg: 4,

            min_points_remaining: 0.05,
            max_log_aff_fac_in_window: 0.7,
            min_frame_age: 1,
            min_frames: 5,

            max_opt_iterations: 6,

            max_time_between_init_frames: 1.0,
            benchmark_initializer_slack_factor: 1.0,

            log_stuff: false,
            debugout_runquiet: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let s = Settings::default();
        assert!(s.max_frames >= 3);
        assert!(s.trace_slack_interval > 0.0);
        assert!(s.re_track_threshold > 1.0);
        // The marginalization precision gate must be below the activation gate,
        // otherwise freshly activated points would be dropped immediately.
        assert!(s.min_idepth_h_marg <= s.min_idepth_h_act);
    }
}
