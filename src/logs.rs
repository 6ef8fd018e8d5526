//! Diagnostic log files, written only when `Settings::log_stuff` is set.
//!
//! All files are truncated on open. The coarse-tracking log is written by
//! the tracking thread, everything else by the mapping thread.

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Result;

use crate::backend::{BackendSpectrum, ResidualCounts};
use crate::calib::CalibHessian;
use crate::frame::{AffLight, FrameShell};
use crate::geometry::SE3;

/// Open writers for the diagnostic files; `None` when logging is disabled.
pub struct DiagnosticLogs {
    calib: Option<BufWriter<File>>,
    nums: Option<BufWriter<File>>,
    coarse_tracking: Option<BufWriter<File>>,
    eigen_all: Option<BufWriter<File>>,
    eigen_pose: Option<BufWriter<File>>,
    eigen_aff: Option<BufWriter<File>>,
    diagonal: Option<BufWriter<File>>,
    variances: Option<BufWriter<File>>,
    nullspaces: Option<BufWriter<File>>,
    dir: std::path::PathBuf,
}

fn open(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(dir.join(name))?))
}

impl DiagnosticLogs {
    /// Disabled logging: every write is a no-op.
    pub fn disabled() -> Self {
        Self {
            calib: None,
            nums: None,
            coarse_tracking: None,
            eigen_all: None,
            eigen_pose: None,
            eigen_aff: None,
            diagonal: None,
            variances: None,
            nullspaces: None,
            dir: std::path::PathBuf::from("logs"),
        }
    }

    /// Open all log files under `dir`, truncating existing ones.
    pub fn open_in(dir: &Path) -> Result<Self> {
        create_dir_all(dir)?;
        Ok(Self {
            calib: Some(open(dir, "calibLog.txt")?),
            nums: Some(open(dir, "numsLog.txt")?),
            coarse_tracking: Some(open(dir, "coarseTrackingLog.txt")?),
            eigen_all: Some(open(dir, "eigenAllLog.txt")?),
            eigen_pose: Some(open(dir, "eigenPLog.txt")?),
            eigen_aff: Some(open(dir, "eigenALog.txt")?),
            diagonal: Some(open(dir, "diagonal.txt")?),
            variances: Some(open(dir, "variancesLog.txt")?),
            nullspaces: Some(open(dir, "nullspacesLog.txt")?),
            dir: dir.to_path_buf(),
        })
    }

    /// One calibration line per keyframe.
    pub fn log_calib(&mut self, kf_id: i64, calib: &CalibHessian) {
        if let Some(w) = self.calib.as_mut() {
            let _ = writeln!(
                w,
                "{} {:.12} {:.12} {:.12} {:.12}",
                kf_id,
                calib.fxl(),
                calib.fyl(),
                calib.cxl(),
                calib.cyl()
            );
            let _ = w.flush();
        }
    }

    /// One coarse-tracking line per tracked frame.
    #[allow(clippy::too_many_arguments)]
    pub fn log_coarse_tracking(
        &mut self,
        id: i64,
        timestamp: f64,
        exposure: f32,
        cam_to_world: &SE3,
        aff: AffLight,
        rmse: f64,
        try_iterations: usize,
    ) {
        if let Some(w) = self.coarse_tracking.as_mut() {
            let xi = cam_to_world.log();
            let _ = write!(w, "{} {:.16} {:.16}", id, timestamp, exposure);
            for v in xi.iter() {
                let _ = write!(w, " {:.16}", v);
            }
            let _ = writeln!(w, " {:.16} {:.16} {:.16} {}", aff.a, aff.b, rmse, try_iterations);
            let _ = w.flush();
        }
    }

    /// One statistics line per keyframe.
    #[allow(clippy::too_many_arguments)]
    pub fn log_nums(
        &mut self,
        kf_id: i64,
        rmse: f32,
        created: usize,
        activated: usize,
        dropped: usize,
        opt_iterations: usize,
        res: ResidualCounts,
        aff: AffLight,
        window_span: i64,
        window_size: usize,
    ) {
        if let Some(w) = self.nums.as_mut() {
            let _ = writeln!(
                w,
                "{} {:.10} {} {} {} {} {} {} {} {:.10} {:.10} {} {}",
                kf_id,
                rmse,
                created,
                activated,
                dropped,
                opt_iterations,
                res.active,
                res.linearized,
                res.marginalized,
                aff.a,
                aff.b,
                window_span,
                window_size
            );
            let _ = w.flush();
        }
    }

    /// Spectral diagnostics of the last optimization.
    pub fn log_spectrum(&mut self, kf_id: i64, spectrum: &BackendSpectrum) {
        fn line(w: &mut Option<BufWriter<File>>, kf_id: i64, values: &[f64]) {
            if let Some(w) = w.as_mut() {
                let _ = write!(w, "{}", kf_id);
                for v in values {
                    let _ = write!(w, " {:.10}", v);
                }
                let _ = writeln!(w);
                let _ = w.flush();
            }
        }
        line(&mut self.eigen_all, kf_id, &spectrum.eigenvalues_all);
        line(&mut self.eigen_pose, kf_id, &spectrum.eigenvalues_pose);
        line(&mut self.eigen_aff, kf_id, &spectrum.eigenvalues_aff);
        line(&mut self.diagonal, kf_id, &spectrum.diagonal);
        line(&mut self.variances, kf_id, &spectrum.variances);
        if let Some(w) = self.nullspaces.as_mut() {
            let _ = write!(w, "{} ", kf_id);
            for (hx, bx) in &spectrum.nullspace_products {
                let _ = write!(w, "{:.10} {:.10} ", hx, bx);
            }
            let _ = writeln!(w);
            let _ = w.flush();
        }
    }

    /// Dump one line per frame of the session, with its lifecycle stats.
    pub fn write_frame_lifetimes(&mut self, shells: &[FrameShell]) -> Result<()> {
        if self.calib.is_none() {
            return Ok(());
        }
        let mut w = open(&self.dir, "lifetimeLog.txt")?;
        for s in shells {
            writeln!(
                w,
                "{} {} {} {} {:.15}",
                s.id,
                s.marginalized_at,
                s.statistics_good_res_on_this,
                s.statistics_outlier_res_on_this,
                s.moved_by_opt
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameId;

    #[test]
    fn test_disabled_logs_are_noops() {
        let mut logs = DiagnosticLogs::disabled();
        logs.log_calib(0, &CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0));
        logs.log_coarse_tracking(0, 0.0, 1.0, &SE3::identity(), AffLight::zero(), 1.0, 1);
        logs.write_frame_lifetimes(&[FrameShell::new(FrameId(0), 0, 0.0)])
            .unwrap();
    }

    #[test]
    fn test_logs_truncate_on_open() {
        let dir = std::env::temp_dir().join("rust_dvio_log_test");
        {
            let mut logs = DiagnosticLogs::open_in(&dir).unwrap();
            logs.log_calib(1, &CalibHessian::new(64, 48, 50.0, 50.0, 32.0, 24.0));
        }
        {
            let _logs = DiagnosticLogs::open_in(&dir).unwrap();
        }
        let content = std::fs::read_to_string(dir.join("calibLog.txt")).unwrap();
        assert!(content.is_empty());
    }
}
