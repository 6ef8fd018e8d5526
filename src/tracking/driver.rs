//! Candidate scoring for coarse tracking.
//!
//! Tries pose candidates in order against the reference keyframe, keeping
//! the per-level best residuals so the aligner can abort bad candidates on
//! coarse levels, and stops early once a candidate is close enough to the
//! previous frame's result.

use tracing::warn;

use crate::frame::{AffLight, FrameHessian};
use crate::geometry::SE3;
use crate::settings::Settings;
use crate::tracking::coarse::CoarseTracker;

/// Result of scoring a candidate list.
#[derive(Debug, Clone)]
pub struct ScoredTrack {
    /// Refined reference-to-frame pose of the winner (or the first
    /// candidate if nothing won).
    pub last_f_to_fh: SE3,
    /// Photometric affine of the winner.
    pub aff_g2l: AffLight,
    /// Flow indicators of the winner.
    pub flow_vecs: [f64; 3],
    /// Per-level minimum residuals over all evaluated candidates.
    pub achieved_res: [f64; 5],
    /// Whether any candidate won.
    pub have_one_good: bool,
    /// Whether the aligner itself reported success (false when only the
    /// inertial override accepted the pose).
    pub tracking_good: bool,
    /// Number of candidates evaluated.
    pub try_iterations: usize,
}

/// Evaluate `candidates` in order. A candidate wins when the aligner
/// reports success, its RMSE is finite, and it strictly improves on the
/// best RMSE so far; per-level minima are folded into `achieved_res` after
/// every winner (NaN counts as worse than anything).
pub fn score_candidates(
    tracker: &mut dyn CoarseTracker,
    frame: &FrameHessian,
    candidates: &[SE3],
    aff_start: AffLight,
    coarsest_level: usize,
    last_coarse_rmse0: f64,
    settings: &Settings,
) -> ScoredTrack {
    let mut flow_vecs = [100.0, 100.0, 100.0];
    let mut last_f_to_fh = SE3::identity();
    let mut aff_g2l = AffLight::zero();

    let mut tracking_good_ret = false;
    let mut achieved_res = [f64::NAN; 5];
    let mut have_one_good = false;
    let mut try_iterations = 0usize;

    for candidate in candidates {
        let mut aff_this = aff_start;
        let mut tracking_is_good = tracker.track_newest(
            frame,
            candidate,
            &mut aff_this,
            coarsest_level,
            &achieved_res,
        );
        try_iterations += 1;

        if tracking_is_good {
            tracking_good_ret = true;
        }
        if !tracking_is_good && settings.use_imu {
            warn!("coarse tracker reports bad tracking; trusting inertial prediction");
            tracking_is_good = true;
        }

        let res = tracker.last_residuals();

        // New winner: strictly better RMSE than anything so far.
        if tracking_is_good && res[0].is_finite() && !(res[0] >= achieved_res[0]) {
            flow_vecs = tracker.last_flow_indicators();
            aff_g2l = aff_this;
            last_f_to_fh = tracker.last_to_new();
            have_one_good = true;
        }

        // Fold in the achieved residuals (NaN entries always lose).
        if have_one_good {
            for (dst, &src) in achieved_res.iter_mut().zip(res.iter()) {
                if !dst.is_finite() || *dst > src {
                    *dst = src;
                }
            }
        }

        if have_one_good && achieved_res[0] < last_coarse_rmse0 * settings.re_track_threshold {
            break;
        }
    }

    if !have_one_good {
        warn!("tracking failed on all candidates; emitting predicted pose");
        flow_vecs = [0.0, 0.0, 0.0];
        aff_g2l = aff_start;
        last_f_to_fh = candidates[0].clone();
    }

    ScoredTrack {
        last_f_to_fh,
        aff_g2l,
        flow_vecs,
        achieved_res,
        have_one_good,
        tracking_good: tracking_good_ret,
        try_iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::CalibHessian;
    use crate::frame::image::ImageAndExposure;
    use crate::frame::{FrameId, FrameShell};

    /// Aligner stub whose residual is the distance of the candidate to a
    /// fixed true pose.
    struct DistanceTracker {
        truth: SE3,
        last: [f64; 5],
        last_pose: SE3,
        fail_all: bool,
        calls: usize,
    }

    impl DistanceTracker {
        fn new(truth: SE3) -> Self {
            Self {
                truth,
                last: [f64::NAN; 5],
                last_pose: SE3::identity(),
                fail_all: false,
                calls: 0,
            }
        }
    }

    impl CoarseTracker for DistanceTracker {
        fn ref_frame_id(&self) -> i64 {
            0
        }
        fn first_coarse_rmse(&self) -> f64 {
            -1.0
        }
        fn set_first_coarse_rmse(&mut self, _rmse: f64) {}
        fn last_ref_aff_g2l(&self) -> AffLight {
            AffLight::zero()
        }
        fn last_ref_exposure(&self) -> f32 {
            1.0
        }
        fn set_reference(
            &mut self,
            _window: &[FrameHessian],
            _shells: &[FrameShell],
            _calib: &CalibHessian,
        ) {
        }
        fn track_newest(
            &mut self,
            _frame: &FrameHessian,
            init: &SE3,
            _aff: &mut AffLight,
            _coarsest_level: usize,
            _achieved_res: &[f64; 5],
        ) -> bool {
            self.calls += 1;
            let err = init.inverse().compose(&self.truth).log().norm();
            self.last = [err, err, err, err, err];
            self.last_pose = init.clone();
            !self.fail_all
        }
        fn last_residuals(&self) -> [f64; 5] {
            self.last
        }
        fn last_flow_indicators(&self) -> [f64; 3] {
            [self.last[0]; 3]
        }
        fn last_to_new(&self) -> SE3 {
            self.last_pose.clone()
        }
    }

    fn dummy_frame(calib: &CalibHessian) -> FrameHessian {
        let img = ImageAndExposure::new(calib.w[0], calib.h[0], 1.0, 0.0);
        FrameHessian::new(FrameId(1), &img, calib)
    }

    fn pose_x(t: f64) -> SE3 {
        SE3::new(nalgebra::UnitQuaternion::identity(), nalgebra::Vector3::new(t, 0.0, 0.0))
    }

    #[test]
    fn test_best_candidate_wins() {
        let calib = CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0);
        let frame = dummy_frame(&calib);
        let truth = pose_x(0.2);
        let mut tracker = DistanceTracker::new(truth.clone());
        let candidates = vec![pose_x(1.0), pose_x(0.2), pose_x(-0.3)];

        let settings = Settings::default();
        let scored = score_candidates(
            &mut tracker,
            &frame,
            &candidates,
            AffLight::zero(),
            4,
            // Large previous RMSE disables the early exit.
            f64::MAX,
            &settings,
        );

        assert!(scored.have_one_good);
        assert!(scored.tracking_good);
        assert!((scored.last_f_to_fh.translation - truth.translation).norm() < 1e-9);
        assert_eq!(scored.try_iterations, 3);
        assert!(scored.achieved_res[0] < 1e-9);
    }

    #[test]
    fn test_early_exit_after_good_candidate() {
        let calib = CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0);
        let frame = dummy_frame(&calib);
        let mut tracker = DistanceTracker::new(pose_x(1.0));
        let candidates = vec![pose_x(1.0), pose_x(0.0), pose_x(0.5)];

        let settings = Settings::default();
        let scored = score_candidates(
            &mut tracker,
            &frame,
            &candidates,
            AffLight::zero(),
            4,
            // Previous RMSE 1.0: the exact first candidate (residual 0)
            // passes 0 < 1.0 * 1.5 immediately.
            1.0,
            &settings,
        );

        assert!(scored.have_one_good);
        assert_eq!(scored.try_iterations, 1);
    }

    #[test]
    fn test_total_failure_emits_first_candidate() {
        let calib = CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0);
        let frame = dummy_frame(&calib);
        let mut tracker = DistanceTracker::new(pose_x(0.0));
        tracker.fail_all = true;
        let candidates = vec![pose_x(0.7), pose_x(0.1)];

        let settings = Settings::default();
        let scored = score_candidates(
            &mut tracker,
            &frame,
            &candidates,
            AffLight::zero(),
            4,
            f64::MAX,
            &settings,
        );

        assert!(!scored.have_one_good);
        assert!(!scored.tracking_good);
        assert!((scored.last_f_to_fh.translation - pose_x(0.7).translation).norm() < 1e-12);
        assert_eq!(scored.flow_vecs, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_imu_override_accepts_but_records_bad_tracking() {
        let calib = CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0);
        let frame = dummy_frame(&calib);
        let mut tracker = DistanceTracker::new(pose_x(0.3));
        tracker.fail_all = true;
        let candidates = vec![pose_x(0.3)];

        let mut settings = Settings::default();
        settings.use_imu = true;
        let scored = score_candidates(
            &mut tracker,
            &frame,
            &candidates,
            AffLight::zero(),
            4,
            f64::MAX,
            &settings,
        );

        // The override lets the candidate win, but the quality flag stays
        // false for the shell's trackingWasGood.
        assert!(scored.have_one_good);
        assert!(!scored.tracking_good);
    }
}
