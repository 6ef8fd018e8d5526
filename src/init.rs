//! Interfaces of the two-view bootstrap initializer and the candidate pixel
//! selector. Both are external collaborators.

use crate::calib::CalibHessian;
use crate::frame::FrameHessian;
use crate::geometry::SE3;

/// A converged initializer point on the first frame.
#[derive(Debug, Clone, Copy)]
pub struct InitializerPoint {
    pub u: f32,
    pub v: f32,
    /// Regularized inverse-depth estimate.
    pub ir: f32,
    /// Selector class of the pixel.
    pub point_type: f32,
}

/// Coarse two-view initializer: accumulates frames until the scene snaps
/// into a consistent two-view reconstruction.
pub trait Initializer: Send {
    /// Shell id of the installed first frame; -1 before `set_first`.
    fn frame_id(&self) -> i64;

    /// Install the first frame. The initializer keeps it until handoff.
    fn set_first(&mut self, calib: &CalibHessian, first: Box<FrameHessian>, timestamp: f64);

    /// Track a follow-up frame; true once initialization converged.
    fn track_frame(&mut self, frame: &FrameHessian) -> bool;

    /// Timestamp of the first frame.
    fn first_frame_timestamp(&self) -> f64;

    /// Hand the first frame back for keyframe installation.
    fn take_first_frame(&mut self) -> Box<FrameHessian>;

    /// Estimated motion from the first frame to the newest one.
    fn this_to_next(&self) -> SE3;

    /// Converged points on the first frame.
    fn points(&self) -> Vec<InitializerPoint>;
}

/// Gradient-based candidate pixel selection on a new keyframe.
pub trait PixelSelector: Send {
    /// Produce a level-0 selection map; nonzero entries mark selected
    /// pixels, the value is the selector class (potential level).
    fn make_maps(&mut self, frame: &FrameHessian, calib: &CalibHessian, density: i32) -> Vec<f32>;
}
