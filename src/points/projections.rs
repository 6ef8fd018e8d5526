//! Point projection helpers shared by tracing, activation and residuals.

use nalgebra::{Matrix3, Vector3};

use crate::calib::CalibHessian;

/// Project a host pixel into a target frame in pixel space.
/// Returns `None` when the projection leaves the safe image region.
#[inline]
pub fn project_point(
    u_pt: f32,
    v_pt: f32,
    idepth: f32,
    krki: &Matrix3<f32>,
    kt: &Vector3<f32>,
    calib: &CalibHessian,
) -> Option<(f32, f32)> {
    let ptp = krki * Vector3::new(u_pt, v_pt, 1.0) + kt * idepth;
    let ku = ptp[0] / ptp[2];
    let kv = ptp[1] / ptp[2];
    let (w, h) = (calib.w[0] as f32, calib.h[0] as f32);
    (ku > 1.1 && kv > 1.1 && ku < w - 3.0 && kv < h - 3.0).then_some((ku, kv))
}

/// Full projection in normalized camera coordinates, returning everything a
/// residual linearization needs.
pub struct FullProjection {
    /// Depth rescaling `1 / z_target`.
    pub drescale: f32,
    /// Normalized target coordinates.
    pub u: f32,
    pub v: f32,
    /// Pixel coordinates in the target image.
    pub ku: f32,
    pub kv: f32,
    /// Inverse depth in the target frame.
    pub new_idepth: f32,
}

/// Project with the metric rotation/translation pair, offsetting the host
/// pixel by a pattern offset `(dx, dy)`.
#[inline]
pub fn project_point_full(
    u_pt: f32,
    v_pt: f32,
    idepth: f32,
    dx: i32,
    dy: i32,
    calib: &CalibHessian,
    r: &Matrix3<f32>,
    t: &Vector3<f32>,
) -> Option<FullProjection> {
    let klip = Vector3::new(
        (u_pt + dx as f32 - calib.cxl()) / calib.fxl(),
        (v_pt + dy as f32 - calib.cyl()) / calib.fyl(),
        1.0,
    );
    let ptp = r * klip + t * idepth;
    let drescale = 1.0 / ptp[2];
    if !(drescale > 0.0) {
        return None;
    }
    let new_idepth = idepth * drescale;
    let u = ptp[0] * drescale;
    let v = ptp[1] * drescale;
    let ku = u * calib.fxl() + calib.cxl();
    let kv = v * calib.fyl() + calib.cyl();

    let (w, h) = (calib.w[0] as f32, calib.h[0] as f32);
    (ku > 1.1 && kv > 1.1 && ku < w - 3.0 && kv < h - 3.0).then_some(FullProjection {
        drescale,
        u,
        v,
        ku,
        kv,
        new_idepth,
    })
}

/// Derivative of the projected pixel position with respect to the host
/// inverse depth, contracted with the image gradient.
#[inline]
pub fn derive_idepth(
    t: &Vector3<f32>,
    u: f32,
    v: f32,
    dx_interp: f32,
    dy_interp: f32,
    drescale: f32,
) -> f32 {
    dx_interp * drescale * (t[0] - t[2] * u) + dy_interp * drescale * (t[1] - t[2] * v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_projection_is_fixed_point() {
        let calib = CalibHessian::new(128, 96, 80.0, 80.0, 64.0, 48.0);
        let krki = Matrix3::identity();
        let kt = Vector3::zeros();
        let (ku, kv) = project_point(40.0, 30.0, 0.5, &krki, &kt, &calib).unwrap();
        assert_relative_eq!(ku, 40.0, epsilon = 1e-5);
        assert_relative_eq!(kv, 30.0, epsilon = 1e-5);
    }

    #[test]
    fn test_translation_shifts_projection() {
        let calib = CalibHessian::new(128, 96, 80.0, 80.0, 64.0, 48.0);
        let krki = Matrix3::identity();
        // K * t for t = (-0.1, 0, 0).
        let kt = Vector3::new(80.0 * -0.1, 0.0, 0.0);
        let (ku, _) = project_point(64.0, 48.0, 1.0, &krki, &kt, &calib).unwrap();
        assert_relative_eq!(ku, 64.0 - 8.0, epsilon = 1e-4);
    }

    #[test]
    fn test_out_of_bounds_returns_none() {
        let calib = CalibHessian::new(128, 96, 80.0, 80.0, 64.0, 48.0);
        let krki = Matrix3::identity();
        let kt = Vector3::new(-500.0, 0.0, 0.0);
        assert!(project_point(5.0, 48.0, 1.0, &krki, &kt, &calib).is_none());
    }

    #[test]
    fn test_full_projection_matches_pixel_projection() {
        let calib = CalibHessian::new(128, 96, 80.0, 80.0, 64.0, 48.0);
        let r = Matrix3::identity();
        let t = Vector3::new(-0.1, 0.05, 0.0);
        let k = crate::frame::hessian::calib_k(&calib);
        let ki = crate::frame::hessian::calib_ki(&calib);
        let krki = k * r * ki;
        let kt = k * t;

        let full = project_point_full(50.0, 40.0, 0.8, 0, 0, &calib, &r, &t).unwrap();
        let (ku, kv) = project_point(50.0, 40.0, 0.8, &krki, &kt, &calib).unwrap();
        assert_relative_eq!(full.ku, ku, epsilon = 1e-3);
        assert_relative_eq!(full.kv, kv, epsilon = 1e-3);
    }
}
