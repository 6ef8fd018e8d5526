//! Lightweight, permanent per-frame identity.

use crate::frame::{AffLight, FrameId};
use crate::geometry::SE3;

/// The permanent record of a frame. Shells live in the session-wide frame
/// history for the lifetime of the session; the heavy per-frame state
/// ([`super::FrameHessian`]) comes and goes with the active window.
///
/// All pose fields are protected by the history lock; see
/// `SharedState::shells`.
#[derive(Debug, Clone)]
pub struct FrameShell {
    /// Monotonic id, equal to the shell's position in the history.
    pub id: FrameId,
    /// Id assigned by the image source.
    pub incoming_id: i64,
    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Estimated camera-to-world pose. Only valid if `pose_valid`.
    pub cam_to_world: SE3,
    /// Pose relative to the tracking reference keyframe.
    pub cam_to_tracking_ref: SE3,
    /// The keyframe this frame was tracked against, if any.
    pub tracking_ref: Option<FrameId>,
    /// Photometric affine parameters of this frame.
    pub aff_g2l: AffLight,

    pub pose_valid: bool,
    /// Whether coarse tracking succeeded without the inertial override.
    pub tracking_was_good: bool,
    /// Keyframe index, or -1 if this frame never became a keyframe.
    pub keyframe_id: i64,
    /// Frame id at which this frame left the active window. Stays equal to
    /// `id` for frames that were never marginalized.
    pub marginalized_at: i64,

    /// Residual bookkeeping for the lifetime log.
    pub statistics_good_res_on_this: u32,
    pub statistics_outlier_res_on_this: u32,
    /// Accumulated pose correction applied by the optimizer.
    pub moved_by_opt: f64,
}

impl FrameShell {
    /// A fresh shell for history position `id`.
    pub fn new(id: FrameId, incoming_id: i64, timestamp: f64) -> Self {
        Self {
            id,
            incoming_id,
            timestamp,
            cam_to_world: SE3::identity(),
            cam_to_tracking_ref: SE3::identity(),
            tracking_ref: None,
            aff_g2l: AffLight::zero(),
            pose_valid: true,
            tracking_was_good: true,
            keyframe_id: -1,
            marginalized_at: id.0,
            statistics_good_res_on_this: 0,
            statistics_outlier_res_on_this: 0,
            moved_by_opt: 0.0,
        }
    }

    /// True if this frame became a keyframe.
    #[inline]
    pub fn is_keyframe(&self) -> bool {
        self.keyframe_id >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_shell_defaults() {
        let s = FrameShell::new(FrameId(5), 42, 1.25);
        assert_eq!(s.id, FrameId(5));
        assert_eq!(s.marginalized_at, 5);
        assert!(!s.is_keyframe());
        assert!(s.pose_valid);
    }
}
