//! Heavy per-frame state, alive only while a frame is being tracked or sits
//! in the active window.

use nalgebra::{Matrix3, Vector3};

use crate::calib::CalibHessian;
use crate::frame::image::{ImageAndExposure, Pyramid};
use crate::frame::{AffLight, FrameId};
use crate::geometry::SE3;
use crate::points::hessian::PointHessian;
use crate::points::immature::ImmaturePoint;

#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
static FRAME_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Per-(host, target) cache of relative pose and photometric transfer,
/// refreshed whenever the window or the optimizer state changes.
#[derive(Debug, Clone)]
pub struct FrameTargetPrecalc {
    /// Window slot of the target frame.
    pub target_idx: usize,
    /// Shell id of the target frame.
    pub target_id: FrameId,
    /// Rotation host -> target.
    pub pre_r_tll: Matrix3<f32>,
    /// Translation host -> target.
    pub pre_t_tll: Vector3<f32>,
    /// `K * R * K^-1` for pixel-space projection.
    pub pre_krki_tll: Matrix3<f32>,
    /// `K * t`.
    pub pre_kt_tll: Vector3<f32>,
    /// Photometric transfer `(a, b)` host -> target.
    pub pre_aff_mode: [f32; 2],
    /// Host brightness offset at the linearization point.
    pub pre_b0_mode: f32,
    /// Baseline between the two frames.
    pub distance_ll: f32,
}

impl FrameTargetPrecalc {
    pub fn set(
        host: &FrameHessian,
        target: &FrameHessian,
        target_idx: usize,
        calib: &CalibHessian,
    ) -> Self {
        let left_to_left = target.pre_world_to_cam.compose(&host.pre_cam_to_world);
        let r: Matrix3<f32> = left_to_left.rotation_matrix().cast();
        let t: Vector3<f32> = left_to_left.translation.cast();

        let k = calib_k(calib);
        let ki = calib_ki(calib);

        let aff = AffLight::from_to_vec_exposure(
            host.ab_exposure,
            target.ab_exposure,
            host.aff_g2l,
            target.aff_g2l,
        );

        Self {
            target_idx,
            target_id: target.shell_id,
            pre_r_tll: r,
            pre_t_tll: t,
            pre_krki_tll: k * r * ki,
            pre_kt_tll: k * t,
            pre_aff_mode: [aff[0] as f32, aff[1] as f32],
            pre_b0_mode: host.aff_g2l_zero.b as f32,
            distance_ll: t.norm(),
        }
    }
}

/// Level-0 intrinsics matrix.
pub fn calib_k(calib: &CalibHessian) -> Matrix3<f32> {
    Matrix3::new(
        calib.fxl(),
        0.0,
        calib.cxl(),
        0.0,
        calib.fyl(),
        calib.cyl(),
        0.0,
        0.0,
        1.0,
    )
}

/// Inverse of the level-0 intrinsics matrix.
pub fn calib_ki(calib: &CalibHessian) -> Matrix3<f32> {
    Matrix3::new(
        1.0 / calib.fxl(),
        0.0,
        -calib.cxl() / calib.fxl(),
        0.0,
        1.0 / calib.fyl(),
        -calib.cyl() / calib.fyl(),
        0.0,
        0.0,
        1.0,
    )
}

/// Heavy state of an active frame: gradient pyramid, pose caches, and the
/// point sets hosted on this frame. Owns a back-reference (by id) to its
/// permanent [`super::FrameShell`].
pub struct FrameHessian {
    /// Shell id of this frame in the history.
    pub shell_id: FrameId,
    /// Keyframe index (position in the keyframe history); -1 before
    /// promotion.
    pub keyframe_index: i64,
    /// Slot in the active window.
    pub idx: usize,

    /// Exposure time of the source image, in ms.
    pub ab_exposure: f32,
    /// Gradient pyramid.
    pub pyramid: Pyramid,

    /// Current photometric affine estimate.
    pub aff_g2l: AffLight,
    /// Affine parameters at the linearization point.
    pub aff_g2l_zero: AffLight,
    /// First-estimate linearization point of the pose.
    pub world_to_cam_eval_pt: SE3,
    /// Cached current world-to-camera pose.
    pub pre_world_to_cam: SE3,
    /// Cached current camera-to-world pose.
    pub pre_cam_to_world: SE3,
    /// Per-target relative-pose cache, indexed like the window.
    pub target_precalc: Vec<FrameTargetPrecalc>,

    pub flagged_for_marginalization: bool,
    /// Per-frame energy threshold inherited from the window.
    pub frame_energy_th: f32,

    /// Inverse-depth hypotheses hosted on this frame.
    pub immature_points: Vec<ImmaturePoint>,
    /// Activated points hosted on this frame.
    pub point_hessians: Vec<PointHessian>,
    /// Points marginalized out of the optimization.
    pub point_hessians_marginalized: Vec<PointHessian>,
    /// Points dropped as outliers.
    pub point_hessians_out: Vec<PointHessian>,
}

impl FrameHessian {
    /// Build the heavy state for a new frame, including its gradient pyramid.
    pub fn new(shell_id: FrameId, image: &ImageAndExposure, calib: &CalibHessian) -> Self {
        #[cfg(debug_assertions)]
        FRAME_INSTANCES.fetch_add(1, Ordering::Relaxed);

        Self {
            shell_id,
            keyframe_index: -1,
            idx: 0,
            ab_exposure: image.exposure_time,
            pyramid: Pyramid::build(&image.image, calib),
            aff_g2l: AffLight::zero(),
            aff_g2l_zero: AffLight::zero(),
            world_to_cam_eval_pt: SE3::identity(),
            pre_world_to_cam: SE3::identity(),
            pre_cam_to_world: SE3::identity(),
            target_precalc: Vec::new(),
            flagged_for_marginalization: false,
            frame_energy_th: 8.0 * 8.0 * crate::calib::PATTERN_NUM as f32,
            immature_points: Vec::new(),
            point_hessians: Vec::new(),
            point_hessians_marginalized: Vec::new(),
            point_hessians_out: Vec::new(),
        }
    }

    /// Install the first-estimate linearization point and refresh the cached
    /// pose pair.
    pub fn set_eval_pt_scaled(&mut self, world_to_cam: &SE3, aff: AffLight) {
        self.world_to_cam_eval_pt = world_to_cam.clone();
        self.aff_g2l = aff;
        self.aff_g2l_zero = aff;
        self.set_pose(world_to_cam);
    }

    /// Refresh the cached current pose pair.
    pub fn set_pose(&mut self, world_to_cam: &SE3) {
        self.pre_world_to_cam = world_to_cam.clone();
        self.pre_cam_to_world = world_to_cam.inverse();
    }

    /// Level-0 gradient buffer.
    #[inline]
    pub fn di(&self) -> &[[f32; 3]] {
        &self.pyramid.di[0]
    }

    /// Number of live heavy frames (debug builds only).
    #[cfg(debug_assertions)]
    pub fn live_instances() -> usize {
        FRAME_INSTANCES.load(Ordering::Relaxed)
    }
}

#[cfg(debug_assertions)]
impl Drop for FrameHessian {
    fn drop(&mut self) {
        FRAME_INSTANCES.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_image(w: usize, h: usize) -> ImageAndExposure {
        let mut img = ImageAndExposure::new(w, h, 10.0, 0.0);
        img.image.fill(128.0);
        img
    }

    #[test]
    fn test_precalc_identity_pair() {
        let calib = CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0);
        let img = flat_image(64, 48);
        let mut a = FrameHessian::new(FrameId(0), &img, &calib);
        let mut b = FrameHessian::new(FrameId(1), &img, &calib);
        a.set_eval_pt_scaled(&SE3::identity(), AffLight::zero());
        b.set_eval_pt_scaled(&SE3::identity(), AffLight::zero());

        let pc = FrameTargetPrecalc::set(&a, &b, 1, &calib);
        assert!(pc.distance_ll < 1e-9);
        assert!((pc.pre_krki_tll - Matrix3::identity()).norm() < 1e-4);
        assert!((pc.pre_aff_mode[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_k_ki_are_inverse() {
        let calib = CalibHessian::new(64, 48, 55.0, 60.0, 31.5, 23.5);
        let prod = calib_k(&calib) * calib_ki(&calib);
        assert!((prod - Matrix3::identity()).norm() < 1e-5);
    }
}
