//! Interface of the nonlinear photometric bundle-adjustment backend.
//!
//! The energy functional, its Schur-complement solver and the
//! marginalization priors are external collaborators; the pipeline only
//! relies on the bookkeeping surface below. The backend mirrors the window
//! contents through the insert/remove notifications and owns nothing.

use crate::calib::CalibHessian;
use crate::frame::{FrameHessian, FrameId};
use crate::points::hessian::PointFrameResidual;

/// Spectral diagnostics of the last solved system, for the optional log
/// files. Backends that do not track these return `None`.
pub struct BackendSpectrum {
    /// Sorted eigenvalues of the full system.
    pub eigenvalues_all: Vec<f64>,
    /// Sorted eigenvalues of the pose block.
    pub eigenvalues_pose: Vec<f64>,
    /// Sorted eigenvalues of the affine block.
    pub eigenvalues_aff: Vec<f64>,
    /// Diagonal of the system matrix.
    pub diagonal: Vec<f64>,
    /// Diagonal of its inverse.
    pub variances: Vec<f64>,
    /// Per-nullspace `(x^T H x, x^T b)` products.
    pub nullspace_products: Vec<(f64, f64)>,
}

/// Residual bookkeeping of the backend, reported after each optimization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidualCounts {
    pub active: usize,
    pub linearized: usize,
    pub marginalized: usize,
}

/// Window-scale nonlinear optimization backend.
pub trait Backend: Send {
    /// A keyframe entered the active window.
    fn insert_frame(&mut self, frame: &FrameHessian);
    /// A keyframe is marginalized out of the window.
    fn marginalize_frame(&mut self, shell_id: FrameId);

    /// An activated point entered the optimization.
    fn insert_point(&mut self, host_id: FrameId);
    /// A point was dropped as an outlier.
    fn drop_point(&mut self, host_id: FrameId);
    /// A point was marginalized, preserving its information as a prior.
    fn marginalize_point(&mut self, host_id: FrameId);
    /// Number of points currently in the optimization.
    fn n_points(&self) -> usize;

    /// A photometric residual was created.
    fn insert_residual(&mut self, res: &PointFrameResidual);
    /// A photometric residual was removed.
    fn drop_residual(&mut self, host_id: FrameId, target_id: FrameId);

    /// Run the window optimization; returns the achieved energy RMSE.
    /// Updates frame states and, when photometric calibration is estimated,
    /// the calibration record.
    fn optimize(
        &mut self,
        window: &mut [FrameHessian],
        calib: &mut CalibHessian,
        iterations: usize,
    ) -> f32;

    /// Snapshot of the keyframe co-observation graph:
    /// `((host_id, target_id), (active_residuals, marginalized_residuals))`.
    fn connectivity(&self) -> Vec<((i64, i64), (u32, u32))>;

    /// Residual counts after the last optimization.
    fn residual_counts(&self) -> ResidualCounts {
        ResidualCounts::default()
    }

    /// Spectral diagnostics of the last solve.
    fn spectrum(&self) -> Option<BackendSpectrum> {
        None
    }
}
