//! Interface of the multi-level direct image aligner.
//!
//! The aligner itself (pyramid residuals, Levenberg steps, per-level
//! convergence) is an external collaborator; the pipeline drives it purely
//! through this trait.

use crate::calib::CalibHessian;
use crate::frame::{AffLight, FrameHessian, FrameShell};
use crate::geometry::SE3;

/// Direct image alignment against the current reference keyframe.
///
/// Two instances exist per session: the one the tracking thread reads, and
/// the one the mapping thread re-targets after each keyframe optimization.
/// They are swapped atomically by the coordinator.
pub trait CoarseTracker: Send {
    /// Shell id of the installed reference keyframe, -1 if none yet.
    fn ref_frame_id(&self) -> i64;

    /// First RMSE achieved against the current reference; negative until
    /// the first successful track.
    fn first_coarse_rmse(&self) -> f64;
    fn set_first_coarse_rmse(&mut self, rmse: f64);

    /// Photometric affine of the reference keyframe.
    fn last_ref_aff_g2l(&self) -> AffLight;
    /// Exposure time of the reference keyframe.
    fn last_ref_exposure(&self) -> f32;

    /// Install the newest window keyframe as the tracking reference.
    fn set_reference(
        &mut self,
        window: &[FrameHessian],
        shells: &[FrameShell],
        calib: &CalibHessian,
    );

    /// Align `frame` against the reference starting from the relative pose
    /// `init` (reference-to-frame) and the photometric seed `aff` (updated
    /// in place).
    ///
    /// `achieved_res` holds the best per-level residuals over previous
    /// candidates (NaN = none); the aligner may abort a level early once it
    /// is worse than the corresponding entry. Returns whether tracking is
    /// considered good.
    fn track_newest(
        &mut self,
        frame: &FrameHessian,
        init: &SE3,
        aff: &mut AffLight,
        coarsest_level: usize,
        achieved_res: &[f64; 5],
    ) -> bool;

    /// Per-level residuals of the most recent `track_newest` call.
    fn last_residuals(&self) -> [f64; 5];
    /// Flow indicators (translation / rotation / combined pixel shift) of
    /// the most recent call.
    fn last_flow_indicators(&self) -> [f64; 3];
    /// Relative pose produced by the most recent call.
    fn last_to_new(&self) -> SE3;
}
