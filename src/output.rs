//! Output sinks: live poses, keyframes, connectivity and status changes are
//! pushed to registered observers.

use tracing::info;

use crate::calib::CalibHessian;
use crate::frame::{FrameHessian, FrameShell};
use crate::imu::DsoImuTransform;

/// Coarse state of the odometry session as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    /// Still inside the visual initializer.
    VisualInit,
    /// Tracking on vision alone.
    VisualOnly,
    /// Tracking with an initialized inertial state.
    VisualInertial,
}

/// Sink for pipeline outputs. All methods default to no-ops so observers
/// implement only what they consume.
#[allow(unused_variables)]
pub trait Observer: Send {
    /// A new frame entered the pipeline.
    fn push_live_frame(&mut self, frame: &FrameHessian) {}

    /// Coarse tracking produced a pose for this frame.
    fn publish_cam_pose(&mut self, shell: &FrameShell, calib: &CalibHessian) {}

    /// The window changed: current keyframes with their hosted points.
    fn publish_keyframes(
        &mut self,
        window: &[FrameHessian],
        shells: &[FrameShell],
        calib: &CalibHessian,
    ) {
    }

    /// Keyframe co-observation graph snapshot.
    fn publish_graph(&mut self, connectivity: &[((i64, i64), (u32, u32))]) {}

    /// Current visual-to-metric transform.
    fn publish_transform_dso_imu(&mut self, transform: &DsoImuTransform) {}

    /// Session status change.
    fn publish_system_status(&mut self, status: SystemStatus) {}
}

/// Observer that reports status changes and window sizes to the log.
#[derive(Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn publish_keyframes(
        &mut self,
        window: &[FrameHessian],
        _shells: &[FrameShell],
        _calib: &CalibHessian,
    ) {
        let points: usize = window.iter().map(|f| f.point_hessians.len()).sum();
        info!(keyframes = window.len(), points, "window updated");
    }

    fn publish_system_status(&mut self, status: SystemStatus) {
        info!(?status, "system status");
    }
}
