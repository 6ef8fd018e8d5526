//! Coarse frame-to-keyframe tracking: the pose-hypothesis driver and the
//! keyframe promotion decision.

pub mod coarse;
pub mod driver;
pub mod hypotheses;
pub mod keyframe_decision;

pub use coarse::CoarseTracker;
pub use driver::{score_candidates, ScoredTrack};
pub use hypotheses::motion_hypotheses;
pub use keyframe_decision::KeyframeDecision;
