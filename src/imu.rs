//! Interface of the inertial subsystem (preintegration, gravity alignment,
//! scale estimation). External collaborator; the pipeline only consumes pose
//! predictions and keyframe lifecycle callbacks.

use nalgebra::Vector3;

use crate::frame::FrameShell;
use crate::geometry::SE3;

/// One inertial measurement.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Angular velocity, rad/s.
    pub gyro: Vector3<f64>,
    /// Linear acceleration, m/s^2.
    pub accel: Vector3<f64>,
}

/// Optional ground-truth pose accompanying a frame, for evaluation.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub cam_to_world: SE3,
    pub velocity: Vector3<f64>,
}

/// Similarity transform from the visual frame into the metric inertial
/// frame.
#[derive(Debug, Clone)]
pub struct DsoImuTransform {
    pub scale: f64,
    pub t_dso_imu: SE3,
}

impl Default for DsoImuTransform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            t_dso_imu: SE3::identity(),
        }
    }
}

/// Inertial integration driven by the coordinator.
///
/// The callback ordering per frame is: `add_imu_data` (tracking thread),
/// then either `prepare_keyframe`/`keyframe_created` or nothing, then after
/// the window optimization `post_optimization` and
/// `finish_keyframe_optimization` on the mapping thread.
pub trait ImuIntegration: Send {
    /// Whether the coarse inertial state (scale, gravity) is initialized;
    /// until then no pose hints are produced.
    fn is_coarse_initialized(&self) -> bool;

    /// Feed the samples spanning the previous-to-current frame interval and
    /// obtain a reference-to-frame pose prediction.
    fn add_imu_data(
        &mut self,
        samples: &[ImuSample],
        frame_id: i64,
        timestamp: f64,
        tracking_ref_changed: bool,
        last_ref_frame_id: i64,
    ) -> SE3;

    /// Feed the same samples to the bundle-adjustment preintegration.
    fn add_imu_data_to_ba(&mut self, samples: &[ImuSample]);

    /// Accumulate a gravity-direction measurement during visual
    /// initialization; returns the current IMU-to-world estimate.
    fn add_gravity_measurement(&mut self, samples: &[ImuSample]) -> SE3;

    /// Camera-from-IMU extrinsic calibration.
    fn t_cam_imu(&self) -> SE3;

    /// Announce that `frame_id` is planned to become a keyframe.
    fn prepare_keyframe(&mut self, frame_id: i64);
    /// The currently prepared keyframe id, -1 if none.
    fn prepared_keyframe(&self) -> i64;
    /// Whether the prepared keyframe was already created by the mapper.
    fn is_prepared_kf_created(&self) -> bool;
    /// The prepared keyframe was skipped by the catch-up rule.
    fn skip_prepared_keyframe(&mut self);
    /// A keyframe is being created for `frame_id`.
    fn keyframe_created(&mut self, frame_id: i64);

    /// Coarse tracking of a frame finished.
    fn finish_coarse_tracking(&mut self, shell: &FrameShell, will_become_keyframe: bool);
    /// A tracking-reference swap happened; rebase the coarse graph and
    /// return the old-reference-to-new-reference transform.
    fn init_coarse_graph(&mut self) -> SE3;
    /// Current scale of the coarse visual frame.
    fn coarse_scale(&self) -> f64;

    /// The window optimization for `frame_id` finished.
    fn post_optimization(&mut self, frame_id: i64);
    /// Finish the keyframe optimization; returns whether the inertial state
    /// is ready (the session may switch to visual-inertial).
    fn finish_keyframe_optimization(&mut self, frame_id: i64) -> bool;
    /// All keyframe operations for `frame_id` are done.
    fn finish_keyframe_operations(&mut self, frame_id: i64);

    /// Store ground truth for evaluation.
    fn set_gt_data(&mut self, gt: Option<&GroundTruth>, frame_id: i64);

    /// Current visual-to-metric transform.
    fn transform_dso_imu(&self) -> DsoImuTransform;
}

/// Inert implementation used when no IMU is attached.
pub struct NoImu;

impl ImuIntegration for NoImu {
    fn is_coarse_initialized(&self) -> bool {
        false
    }
    fn add_imu_data(
        &mut self,
        _samples: &[ImuSample],
        _frame_id: i64,
        _timestamp: f64,
        _tracking_ref_changed: bool,
        _last_ref_frame_id: i64,
    ) -> SE3 {
        SE3::identity()
    }
    fn add_imu_data_to_ba(&mut self, _samples: &[ImuSample]) {}
    fn add_gravity_measurement(&mut self, _samples: &[ImuSample]) -> SE3 {
        SE3::identity()
    }
    fn t_cam_imu(&self) -> SE3 {
        SE3::identity()
    }
    fn prepare_keyframe(&mut self, _frame_id: i64) {}
    fn prepared_keyframe(&self) -> i64 {
        -1
    }
    fn is_prepared_kf_created(&self) -> bool {
        false
    }
    fn skip_prepared_keyframe(&mut self) {}
    fn keyframe_created(&mut self, _frame_id: i64) {}
    fn finish_coarse_tracking(&mut self, _shell: &FrameShell, _will_become_keyframe: bool) {}
    fn init_coarse_graph(&mut self) -> SE3 {
        SE3::identity()
    }
    fn coarse_scale(&self) -> f64 {
        1.0
    }
    fn post_optimization(&mut self, _frame_id: i64) {}
    fn finish_keyframe_optimization(&mut self, _frame_id: i64) -> bool {
        false
    }
    fn finish_keyframe_operations(&mut self, _frame_id: i64) {}
    fn set_gt_data(&mut self, _gt: Option<&GroundTruth>, _frame_id: i64) {}
    fn transform_dso_imu(&self) -> DsoImuTransform {
        DsoImuTransform::default()
    }
}
