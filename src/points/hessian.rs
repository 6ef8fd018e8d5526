//! Activated map points and their photometric residuals.

use crate::calib::{CalibHessian, PATTERN_NUM, PATTERN_P};
use crate::frame::hessian::FrameTargetPrecalc;
use crate::frame::image::interpolated_element_33;
use crate::frame::FrameId;
use crate::points::immature::ImmaturePoint;
use crate::points::projections::project_point_full;
use crate::settings::Settings;

#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
static POINT_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// State of a single photometric residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResState {
    /// Inlier, participating in the optimization.
    In,
    /// Projection left the image or depth became invalid.
    Oob,
    /// Energy above threshold.
    Outlier,
}

/// Lifecycle state of an activated point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStatus {
    Active,
    Marginalized,
    Outlier,
    Drop,
}

/// Photometric residual tying a hosted point to a target frame.
///
/// Carries only ids: the host/target heavy frames live in the window arena
/// and are resolved by the caller.
#[derive(Debug, Clone)]
pub struct PointFrameResidual {
    pub host_id: FrameId,
    pub target_id: FrameId,
    pub state: ResState,
    pub new_state: ResState,
    pub energy: f32,
    pub new_energy: f32,
}

impl PointFrameResidual {
    pub fn new(host_id: FrameId, target_id: FrameId) -> Self {
        Self {
            host_id,
            target_id,
            state: ResState::In,
            new_state: ResState::Outlier,
            energy: 0.0,
            new_energy: 0.0,
        }
    }

    /// Re-evaluate the residual at the point's current inverse depth,
    /// setting `new_state`/`new_energy`.
    pub fn linearize(
        &mut self,
        point: &PointHessian,
        calib: &CalibHessian,
        settings: &Settings,
        precalc: &FrameTargetPrecalc,
        target_di: &[[f32; 3]],
    ) -> f32 {
        let mut energy = 0.0f32;
        let aff = precalc.pre_aff_mode;

        for idx in 0..PATTERN_NUM {
            let proj = match project_point_full(
                point.u,
                point.v,
                point.idepth,
                PATTERN_P[idx][0],
                PATTERN_P[idx][1],
                calib,
                &precalc.pre_r_tll,
                &precalc.pre_t_tll,
            ) {
                Some(p) => p,
                None => {
                    self.new_state = ResState::Oob;
                    return self.energy;
                }
            };

            let hit = interpolated_element_33(target_di, proj.ku, proj.kv, calib.w[0]);
            if !hit[0].is_finite() {
                self.new_state = ResState::Oob;
                return self.energy;
            }
            let residual = hit[0] - (aff[0] * point.color[idx] + aff[1]);
            let hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy +=
                point.weights[idx] * point.weights[idx] * hw * residual * residual * (2.0 - hw);
        }

        if energy > point.energy_th {
            self.new_state = ResState::Outlier;
        } else {
            self.new_state = ResState::In;
        }
        self.new_energy = energy;
        energy
    }

    /// Accept the newly computed state.
    pub fn apply(&mut self) {
        self.state = self.new_state;
        self.energy = self.new_energy;
    }
}

/// An activated point with a scalar inverse depth, hosted on a window frame.
#[derive(Debug, Clone)]
pub struct PointHessian {
    pub host_id: FrameId,
    pub u: f32,
    pub v: f32,
    pub point_type: f32,

    pub color: [f32; PATTERN_NUM],
    pub weights: [f32; PATTERN_NUM],
    pub energy_th: f32,

    /// Current inverse depth estimate.
    pub idepth: f32,
    /// Inverse depth at the linearization point.
    pub idepth_zero: f32,
    /// Posterior precision of the inverse depth.
    pub idepth_hessian: f32,
    /// Largest relative baseline this point was observed under.
    pub max_rel_baseline: f32,
    /// Accumulated count of good residuals over the point's lifetime.
    pub num_good_residuals: u32,
    pub has_depth_prior: bool,

    pub status: PointStatus,
    /// Residuals against target frames, owned here; the backend references
    /// them by (host, target) ids.
    pub residuals: Vec<PointFrameResidual>,
    /// States of the residuals against the two most recent frames:
    /// `[0]` newest, `[1]` the one before.
    pub last_residuals: [(Option<FrameId>, ResState); 2],
}

impl PointHessian {
    /// Promote an immature point. The inverse depth is set by the caller
    /// afterwards via [`PointHessian::set_idepth`].
    pub fn from_immature(pt: &ImmaturePoint, host_id: FrameId) -> Self {
        #[cfg(debug_assertions)]
        POINT_INSTANCES.fetch_add(1, Ordering::Relaxed);

        Self {
            host_id,
            u: pt.u,
            v: pt.v,
            point_type: pt.point_type,
            color: pt.color,
            weights: pt.weights,
            energy_th: pt.energy_th,
            idepth: (pt.idepth_max + pt.idepth_min) * 0.5,
            idepth_zero: (pt.idepth_max + pt.idepth_min) * 0.5,
            idepth_hessian: 0.0,
            max_rel_baseline: 0.0,
            num_good_residuals: 0,
            has_depth_prior: false,
            status: PointStatus::Active,
            residuals: Vec::new(),
            last_residuals: [(None, ResState::Oob), (None, ResState::Oob)],
        }
    }

    pub fn set_idepth(&mut self, idepth: f32) {
        self.idepth = idepth;
    }

    pub fn set_idepth_zero(&mut self, idepth: f32) {
        self.idepth_zero = idepth;
    }

    /// Whether the point currently qualifies as an inlier.
    pub fn is_inlier_new(&self, settings: &Settings) -> bool {
        self.residuals.len() >= settings.min_good_active_res_for_marg
            && self.num_good_residuals >= settings.min_good_res_for_marg
    }

    /// Whether the point has effectively no future observations: its recent
    /// residuals died, or most of its support is on frames about to leave
    /// the window.
    pub fn is_oob(&self, to_marg_ids: &[FrameId], settings: &Settings) -> bool {
        let vis_in_to_marg = self
            .residuals
            .iter()
            .filter(|r| r.state == ResState::In && to_marg_ids.contains(&r.target_id))
            .count();

        if self.residuals.len() >= settings.min_good_active_res_for_marg
            && self.num_good_residuals > settings.min_good_res_for_marg + 10
            && self.residuals.len() - vis_in_to_marg < settings.min_good_active_res_for_marg
        {
            return true;
        }

        if self.last_residuals[0].1 == ResState::Oob {
            return true;
        }
        if self.residuals.len() < 2 {
            return false;
        }
        if self.last_residuals[0].1 == ResState::Outlier
            && self.last_residuals[1].1 == ResState::Outlier
        {
            return true;
        }
        false
    }

    /// Number of live activated points (debug builds only).
    #[cfg(debug_assertions)]
    pub fn live_instances() -> usize {
        POINT_INSTANCES.load(Ordering::Relaxed)
    }
}

#[cfg(debug_assertions)]
impl Drop for PointHessian {
    fn drop(&mut self) {
        POINT_INSTANCES.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_point() -> PointHessian {
        let settings = Settings::default();
        let calib = CalibHessian::new(128, 96, 80.0, 80.0, 64.0, 48.0);
        let image = vec![100.0f32; 128 * 96];
        let di = crate::frame::image::Pyramid::build(&image, &calib).di[0].clone();
        let imm = ImmaturePoint::new(64.0, 48.0, 1.0, &di, &calib, &settings).unwrap();
        PointHessian::from_immature(&imm, FrameId(0))
    }

    #[test]
    fn test_is_oob_on_recent_oob_residual() {
        let settings = Settings::default();
        let mut p = test_point();
        p.last_residuals[0] = (Some(FrameId(9)), ResState::Oob);
        assert!(p.is_oob(&[], &settings));
    }

    #[test]
    fn test_is_oob_on_double_outlier() {
        let settings = Settings::default();
        let mut p = test_point();
        p.residuals.push(PointFrameResidual::new(FrameId(0), FrameId(1)));
        p.residuals.push(PointFrameResidual::new(FrameId(0), FrameId(2)));
        p.last_residuals[0] = (Some(FrameId(2)), ResState::Outlier);
        p.last_residuals[1] = (Some(FrameId(1)), ResState::Outlier);
        assert!(p.is_oob(&[], &settings));
    }

    #[test]
    fn test_is_oob_when_support_leaves_window() {
        let settings = Settings::default();
        let mut p = test_point();
        for t in 1..=3 {
            let mut r = PointFrameResidual::new(FrameId(0), FrameId(t));
            r.state = ResState::In;
            p.residuals.push(r);
        }
        p.num_good_residuals = settings.min_good_res_for_marg + 11;
        p.last_residuals[0] = (Some(FrameId(3)), ResState::In);
        // Two of the three supporting frames are about to be marginalized.
        assert!(p.is_oob(&[FrameId(1), FrameId(2)], &settings));
        assert!(!p.is_oob(&[], &settings));
    }

    #[test]
    fn test_inlier_requires_residual_count_and_history() {
        let settings = Settings::default();
        let mut p = test_point();
        assert!(!p.is_inlier_new(&settings));
        for t in 1..=3 {
            p.residuals.push(PointFrameResidual::new(FrameId(0), FrameId(t)));
        }
        p.num_good_residuals = settings.min_good_res_for_marg;
        assert!(p.is_inlier_new(&settings));
    }
}
