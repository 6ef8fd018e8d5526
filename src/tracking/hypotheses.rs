//! Pose-candidate generation for coarse tracking.
//!
//! When no inertial hint is available, the tracker is seeded with an ordered
//! list of motion hypotheses derived from the two most recent frames, plus a
//! fan of small rotation perturbations around the constant-motion candidate.
//! If tracking fails on all of them we lose the frame, so the list is
//! deliberately generous; unpromising candidates die cheaply on the coarsest
//! pyramid level.

use crate::geometry::SE3;

/// Magnitude of the quaternion-component rotation perturbations. A single
/// pass is applied.
pub const ROT_DELTA: f64 = 0.02;

/// Recent-motion context for hypothesis generation, snapshotted under the
/// shell pose lock.
#[derive(Debug, Clone)]
pub struct MotionContext {
    /// Number of frames in the history, including the current one.
    pub history_len: usize,
    /// camToWorld of the previous frame.
    pub slast_to_world: SE3,
    /// camToWorld of the frame before the previous one.
    pub sprelast_to_world: SE3,
    /// camToWorld of the current tracking reference keyframe.
    pub last_f_to_world: SE3,
    /// False if any of the three poses above is invalid.
    pub poses_valid: bool,
}

/// Ordered candidate list of reference-to-frame transforms.
///
/// Index 0 is the constant-motion hypothesis (assuming the last inter-frame
/// motion repeats), followed by double, half, zero motion, identity-from-
/// keyframe, and 26 rotation-perturbed variants of the constant-motion
/// candidate covering all sign combinations over the quaternion axes.
pub fn motion_hypotheses(ctx: &MotionContext) -> Vec<SE3> {
    if ctx.history_len == 2 {
        return vec![SE3::identity()];
    }

    if !ctx.poses_valid {
        return vec![SE3::identity()];
    }

    let fh_to_slast = ctx.sprelast_to_world.inverse().compose(&ctx.slast_to_world);
    let last_f_to_slast = ctx.slast_to_world.inverse().compose(&ctx.last_f_to_world);

    let fh_to_slast_inv = fh_to_slast.inverse();
    let const_motion = fh_to_slast_inv.compose(&last_f_to_slast);

    let mut tries = Vec::with_capacity(31);
    tries.push(const_motion.clone());
    // Double motion: one frame was skipped.
    tries.push(fh_to_slast_inv.compose(&fh_to_slast_inv).compose(&last_f_to_slast));
    // Half motion.
    tries.push(
        SE3::exp(&(fh_to_slast.log() * 0.5))
            .inverse()
            .compose(&last_f_to_slast),
    );
    // Zero motion.
    tries.push(last_f_to_slast);
    // Zero motion from the keyframe itself.
    tries.push(SE3::identity());

    // Rotation fan around the constant-motion candidate.
    for &sx in &[0.0, 1.0, -1.0] {
        for &sy in &[0.0, 1.0, -1.0] {
            for &sz in &[0.0, 1.0, -1.0] {
                if sx == 0.0 && sy == 0.0 && sz == 0.0 {
                    continue;
                }
                tries.push(const_motion.compose(&SE3::from_quaternion_coeffs(
                    1.0,
                    sx * ROT_DELTA,
                    sy * ROT_DELTA,
                    sz * ROT_DELTA,
                )));
            }
        }
    }

    tries
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn moving_context() -> MotionContext {
        // Constant forward motion of 0.1 along x per frame; the reference
        // keyframe coincides with the pre-previous frame.
        let step = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(0.1, 0.0, 0.0));
        let sprelast = SE3::identity();
        let slast = step.clone();
        MotionContext {
            history_len: 10,
            slast_to_world: slast,
            sprelast_to_world: sprelast.clone(),
            last_f_to_world: sprelast,
            poses_valid: true,
        }
    }

    #[test]
    fn test_candidate_count_and_order() {
        let tries = motion_hypotheses(&moving_context());
        assert_eq!(tries.len(), 31);
        // Candidate 4 is the identity (zero motion from keyframe).
        assert_relative_eq!(tries[4].translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(tries[4].rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_motion_extrapolates() {
        // With uniform motion, the constant-motion candidate predicts the
        // reference-to-frame transform one step beyond the previous frame.
        let tries = motion_hypotheses(&moving_context());
        // last_f == sprelast, so reference-to-frame = two steps backwards.
        assert_relative_eq!(
            tries[0].translation,
            Vector3::new(-0.2, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_perturbations_rotate_constant_motion() {
        let tries = motion_hypotheses(&moving_context());
        for t in &tries[5..] {
            let delta = tries[0].rotation.inverse() * t.rotation;
            assert!(delta.angle() > 0.0);
            assert!(delta.angle() < 0.1);
        }
        // All 26 perturbations are distinct.
        for i in 5..tries.len() {
            for j in (i + 1)..tries.len() {
                let d = tries[i].rotation.inverse() * tries[j].rotation;
                assert!(d.angle() > 1e-6);
            }
        }
    }

    #[test]
    fn test_invalid_poses_collapse_to_identity() {
        let mut ctx = moving_context();
        ctx.poses_valid = false;
        let tries = motion_hypotheses(&ctx);
        assert_eq!(tries.len(), 1);
        assert_relative_eq!(tries[0].translation.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_two_frame_history_yields_identity() {
        let mut ctx = moving_context();
        ctx.history_len = 2;
        let tries = motion_hypotheses(&ctx);
        assert_eq!(tries.len(), 1);
    }
}
