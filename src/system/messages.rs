//! Inter-thread message types.
//!
//! Sent from the tracking thread to the mapping worker via the
//! tracked-frame channel.

use crate::frame::FrameHessian;

/// Message sent from tracking to mapping for every coarse-tracked frame.
///
/// Carries the heavy frame state (pyramid included); the shell already
/// holds the tracking outputs. Whether the frame actually becomes a
/// keyframe is decided by the mapper: `tentative_keyframe` records the
/// tracking thread's intent at delivery time, but the authoritative signal
/// is `SharedState::need_kf_after`, so a newer tracked frame can take over
/// a still-pending promotion.
pub struct TrackedFrame {
    /// The frame to map.
    pub fh: Box<FrameHessian>,
    /// Promotion intent at delivery time.
    pub tentative_keyframe: bool,
}

impl TrackedFrame {
    pub fn new(fh: Box<FrameHessian>, tentative_keyframe: bool) -> Self {
        Self {
            fh,
            tentative_keyframe,
        }
    }
}
