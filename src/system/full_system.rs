//! The pipeline coordinator.
//!
//! [`FullSystem`] owns the tracking-thread side of the pipeline: frame
//! ingestion, the initializer handoff, coarse tracking with pose-hypothesis
//! scoring, the keyframe decision, and the handoff to the mapping worker.
//! The mapping worker itself lives in [`super::mapper`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::calib::CalibHessian;
use crate::frame::{AffLight, FrameHessian, FrameId, FrameShell, ImageAndExposure};
use crate::geometry::SE3;
use crate::imu::{GroundTruth, ImuIntegration, ImuSample};
use crate::init::{Initializer, PixelSelector};
use crate::logs::DiagnosticLogs;
use crate::output::{Observer, SystemStatus};
use crate::points::hessian::{PointHessian, PointStatus};
use crate::points::immature::ImmaturePoint;
use crate::settings::Settings;
use crate::system::mapper::{self, MappingState};
use crate::system::messages::TrackedFrame;
use crate::system::shared::SharedState;
use crate::tracking::hypotheses::{motion_hypotheses, MotionContext};
use crate::tracking::keyframe_decision::{KeyframeDecision, KeyframeInputs};
use crate::tracking::{score_candidates, CoarseTracker};

/// The external collaborators a session is assembled from.
pub struct ExternalModules {
    pub coarse_tracker: Box<dyn CoarseTracker>,
    pub coarse_tracker_for_new_kf: Box<dyn CoarseTracker>,
    pub initializer: Box<dyn Initializer>,
    pub pixel_selector: Box<dyn PixelSelector>,
    pub backend: Box<dyn Backend>,
    pub imu: Box<dyn ImuIntegration>,
}

/// Options for [`FullSystem::save_trajectory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajectoryOptions {
    /// Omit frames that were never marginalized (non-keyframes).
    pub only_log_kf_poses: bool,
    /// Transform poses into the metric inertial frame.
    pub save_metric_poses: bool,
    /// Materialize non-keyframe poses from their tracking reference.
    pub use_cam_to_tracking_ref: bool,
}

/// Direct sparse visual-inertial odometry front-end.
pub struct FullSystem {
    settings: Arc<Settings>,
    shared: Arc<SharedState>,

    tx: Sender<TrackedFrame>,
    /// Kept to drain undelivered frames at shutdown.
    rx: Receiver<TrackedFrame>,
    mapping_handle: Option<JoinHandle<()>>,

    initializer: Box<dyn Initializer>,
    kf_decision: KeyframeDecision,

    /// Achieved residuals of the last successful coarse track.
    last_coarse_rmse: [f64; 5],
    /// World pose of the first keyframe (gravity-aligned in IMU mode).
    first_pose: SE3,
    initialized: bool,
    second_keyframe_done: bool,
}

impl FullSystem {
    /// Assemble a session and spawn the mapping worker.
    pub fn new(
        settings: Arc<Settings>,
        calib: CalibHessian,
        modules: ExternalModules,
    ) -> Result<Self> {
        let logs = if settings.log_stuff {
            DiagnosticLogs::open_in(Path::new("logs")).context("opening diagnostic logs")?
        } else {
            DiagnosticLogs::disabled()
        };

        let mapping = MappingState::new(modules.backend, modules.pixel_selector, &calib);
        let shared = SharedState::new(
            settings.clone(),
            calib,
            mapping,
            modules.coarse_tracker,
            modules.coarse_tracker_for_new_kf,
            modules.imu,
            logs,
        );

        let (tx, rx) = unbounded::<TrackedFrame>();
        let mapping_handle = {
            let shared = shared.clone();
            let rx = rx.clone();
            thread::Builder::new()
                .name("mapping".into())
                .spawn(move || mapper::run_mapping_loop(shared, rx))
                .context("spawning mapping thread")?
        };

        Ok(Self {
            settings,
            shared,
            tx,
            rx,
            mapping_handle: Some(mapping_handle),
            initializer: modules.initializer,
            kf_decision: KeyframeDecision::new(),
            last_coarse_rmse: [100.0; 5],
            first_pose: SE3::identity(),
            initialized: false,
            second_keyframe_done: false,
        })
    }

    /// Register an output sink.
    pub fn add_observer(&self, observer: Box<dyn Observer>) {
        self.shared.observers.lock().push(observer);
    }

    /// Install the photometric response function.
    pub fn set_gamma_function(&self, b_inv: &[f32; 256]) {
        self.shared.calib.write().set_gamma_function(b_inv);
    }

    /// Shared state handle, for inspection and visualization.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    pub fn init_failed(&self) -> bool {
        self.shared.init_failed()
    }

    pub fn reset_requested(&self) -> bool {
        self.shared.reset_requested()
    }

    /// Ingest one frame with the inertial samples spanning the interval
    /// since the previous frame.
    pub fn process_frame(
        &mut self,
        image: &ImageAndExposure,
        source_id: i64,
        imu_samples: &[ImuSample],
        gt: Option<&GroundTruth>,
    ) -> Result<()> {
        if self.shared.is_lost() {
            return Ok(());
        }

        // Create the permanent shell and the heavy frame state.
        let id = {
            let mut shells = self.shared.shells.lock();
            let id = FrameId(shells.len() as i64);
            shells.push(FrameShell::new(id, source_id, image.timestamp));
            id
        };
        let fh = {
            let calib = self.shared.calib.read();
            Box::new(FrameHessian::new(id, image, &calib))
        };

        if !self.initialized {
            self.feed_initializer(fh, imu_samples, gt)
        } else {
            self.track_frame(fh, imu_samples, gt)
        }
    }

    /// Initialization path: drive the external two-view initializer.
    fn feed_initializer(
        &mut self,
        fh: Box<FrameHessian>,
        imu_samples: &[ImuSample],
        gt: Option<&GroundTruth>,
    ) -> Result<()> {
        let settings = self.settings.clone();
        let id = fh.shell_id;
        let timestamp = {
            let shells = self.shared.shells.lock();
            shells[id.index()].timestamp
        };

        if self.initializer.frame_id() < 0 {
            // First frame: the initializer keeps it.
            {
                let calib = self.shared.calib.read();
                self.initializer.set_first(&calib, fh, timestamp);
            }
            if settings.use_imu {
                self.shared.imu.lock().add_gravity_measurement(imu_samples);
            }
            for ow in self.shared.observers.lock().iter_mut() {
                ow.publish_system_status(SystemStatus::VisualInit);
            }
            return Ok(());
        }

        let mut fh = fh;
        let init_done = self.initializer.track_frame(&fh);
        if settings.use_imu {
            let mut imu = self.shared.imu.lock();
            imu.add_imu_data_to_ba(imu_samples);
            let imu_to_world = imu.add_gravity_measurement(imu_samples);
            if init_done {
                self.first_pose = imu_to_world.compose(&imu.t_cam_imu().inverse());
            }
        }

        if init_done {
            self.initialize_from_initializer(&mut fh)?;
            if settings.use_imu && settings.linearize_operation {
                self.shared.imu.lock().set_gt_data(gt, id.0);
            }
            for ow in self.shared.observers.lock().iter_mut() {
                ow.publish_system_status(SystemStatus::VisualOnly);
            }
            self.deliver_tracked_frame(fh, true);
        } else {
            let since_first = timestamp - self.initializer.first_frame_timestamp();
            debug!(since_first, "still initializing");
            if since_first > settings.max_time_between_init_frames {
                // Give up: the next frame restarts initialization.
                self.shared.full_reset_requested.store(true, Ordering::SeqCst);
            } else {
                let mut shells = self.shared.shells.lock();
                shells[id.index()].pose_valid = false;
                drop(shells);
                drop(fh);
            }
        }
        Ok(())
    }

    /// Tracking path: reference swap, coarse tracking, keyframe decision,
    /// delivery.
    fn track_frame(
        &mut self,
        mut fh: Box<FrameHessian>,
        imu_samples: &[ImuSample],
        gt: Option<&GroundTruth>,
    ) -> Result<()> {
        let settings = self.settings.clone();
        let id = fh.shell_id;

        // Swap in the fresher tracking reference if the mapper finished one.
        let mut tracking_ref_changed = false;
        let mut last_ref_frame_id = -1i64;
        if self.shared.coarse_for_kf_ref_id.load(Ordering::SeqCst)
            > self.shared.coarse_ref_id.load(Ordering::SeqCst)
        {
            self.shared.swap_coarse_trackers();
            if settings.use_imu {
                last_ref_frame_id = self.shared.coarse_ref_id.load(Ordering::SeqCst);
                let mut imu = self.shared.imu.lock();
                debug_assert_eq!(last_ref_frame_id, imu.prepared_keyframe());
                let _last_ref_to_new = imu.init_coarse_graph();
                tracking_ref_changed = true;
            }
        }

        // Inertial pose prediction.
        let mut hint: Option<SE3> = None;
        if settings.use_imu {
            let timestamp = self.shared.shells.lock()[id.index()].timestamp;
            let mut imu = self.shared.imu.lock();
            let prediction = imu.add_imu_data(
                imu_samples,
                id.0,
                timestamp,
                tracking_ref_changed,
                last_ref_frame_id,
            );
            if imu.is_coarse_initialized() {
                hint = Some(prediction);
            }
            imu.add_imu_data_to_ba(imu_samples);
        }

        let (tres, tracking_good) = self.track_new_coarse(&mut fh, hint)?;

        // Keyframe decision.
        let mut force_no_kf = !tracking_good;
        let mut force_kf = false;
        if !tres.iter().all(|v| v.is_finite()) {
            if settings.use_imu {
                // Nothing to track visually: promote anyway on IMU.
                force_no_kf = false;
                force_kf = true;
            } else {
                error!("initial tracking failed: lost");
                self.shared.is_lost.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        let mut need_kf = {
            let (timestamp, history_len) = {
                let shells = self.shared.shells.lock();
                (shells[id.index()].timestamp, shells.len())
            };
            let last_kf_timestamp = {
                let keyframes = self.shared.keyframes.lock();
                let shells = self.shared.shells.lock();
                keyframes
                    .last()
                    .map(|kf| shells[kf.index()].timestamp)
                    .unwrap_or(0.0)
            };

            let tracker = self.shared.coarse_tracker.lock();
            let (ref_exposure, ref_aff, first_rmse) = (
                tracker.last_ref_exposure(),
                tracker.last_ref_aff_g2l(),
                tracker.first_coarse_rmse(),
            );
            drop(tracker);

            let fh_aff = self.shared.shells.lock()[id.index()].aff_g2l;
            let ref_to_fh =
                AffLight::from_to_vec_exposure(ref_exposure, fh.ab_exposure, ref_aff, fh_aff);

            let calib = self.shared.calib.read();
            let inputs = KeyframeInputs {
                history_len,
                timestamp,
                last_kf_timestamp,
                tres,
                ref_to_fh_a: ref_to_fh[0],
                first_coarse_rmse: first_rmse,
                force_kf,
                w_plus_h: (calib.w[0] + calib.h[0]) as f64,
            };
            self.kf_decision.needs_keyframe(&settings, &inputs)
        };

        // Suppress promotion for tiny metric translations in IMU mode.
        if settings.use_imu {
            let imu = self.shared.imu.lock();
            if imu.is_coarse_initialized() {
                let trans_norm = self.shared.shells.lock()[id.index()]
                    .cam_to_tracking_ref
                    .translation_norm()
                    * imu.coarse_scale();
                if trans_norm < settings.force_no_kf_translation_thresh {
                    force_no_kf = true;
                }
            }
        }
        if force_no_kf {
            debug!("forcing no keyframe");
            need_kf = false;
        }

        if need_kf {
            let frames_between = {
                let shells = self.shared.shells.lock();
                let prev_kf_id = shells[id.index()]
                    .tracking_ref
                    .map(|r| r.0)
                    .unwrap_or(id.0);
                id.0 - prev_kf_id - 1
            };
            if !self
                .kf_decision
                .enforce_min_spacing(&settings, frames_between)
            {
                debug!("skipping keyframe: minimum spacing");
                need_kf = false;
            }
        }

        if settings.use_imu {
            let shells = self.shared.shells.lock();
            self.shared
                .imu
                .lock()
                .finish_coarse_tracking(&shells[id.index()], need_kf);
        }
        if need_kf && settings.use_imu && settings.linearize_operation {
            self.shared.imu.lock().set_gt_data(gt, id.0);
        }

        {
            let shells = self.shared.shells.lock();
            let calib = self.shared.calib.read();
            for ow in self.shared.observers.lock().iter_mut() {
                ow.publish_cam_pose(&shells[id.index()], &calib);
            }
        }

        self.deliver_tracked_frame(fh, need_kf);
        Ok(())
    }

    /// Coarse tracking of one frame: candidate generation, scoring, and
    /// shell pose write-back. Returns `([rmse, flow_t, flow_r, flow_rt],
    /// tracking_good)`.
    fn track_new_coarse(
        &mut self,
        fh: &mut FrameHessian,
        hint: Option<SE3>,
    ) -> Result<([f64; 4], bool)> {
        let settings = self.settings.clone();
        let id = fh.shell_id;

        for ow in self.shared.observers.lock().iter_mut() {
            ow.push_live_frame(fh);
        }

        let mut tracker = self.shared.coarse_tracker.lock();
        let last_f_id = FrameId(tracker.ref_frame_id());

        // Candidate list and photometric seed, snapshotted under the
        // history lock.
        let mut aff_last = AffLight::zero();
        let candidates: Vec<SE3> = {
            let shells = self.shared.shells.lock();
            let n = shells.len();

            if let Some(hint) = hint {
                // Seed the affine from the most recent well-tracked frame
                // sharing this reference.
                for i in (0..n.saturating_sub(1)).rev() {
                    let s = &shells[i];
                    if s.tracking_was_good {
                        aff_last = s.aff_g2l;
                        break;
                    }
                    if s.tracking_ref != Some(last_f_id) {
                        warn!("no well-tracked frame with the current reference");
                        aff_last = tracker.last_ref_aff_g2l();
                        break;
                    }
                }
                vec![hint]
            } else if n == 2 {
                vec![SE3::identity()]
            } else {
                let slast = &shells[n - 2];
                let sprelast = &shells[n - 3];
                let last_f_shell = &shells[last_f_id.index()];
                aff_last = slast.aff_g2l;
                motion_hypotheses(&MotionContext {
                    history_len: n,
                    slast_to_world: slast.cam_to_world.clone(),
                    sprelast_to_world: sprelast.cam_to_world.clone(),
                    last_f_to_world: last_f_shell.cam_to_world.clone(),
                    poses_valid: slast.pose_valid
                        && sprelast.pose_valid
                        && last_f_shell.pose_valid,
                })
            }
        };

        let coarsest_level = self.shared.calib.read().levels - 1;
        let scored = score_candidates(
            &mut **tracker,
            fh,
            &candidates,
            aff_last,
            coarsest_level,
            self.last_coarse_rmse[0],
            &settings,
        );

        if !scored.have_one_good {
            if scored.last_f_to_fh.translation_norm() > 1e5 || scored.last_f_to_fh.has_nan() {
                self.shared.is_lost.store(true, Ordering::SeqCst);
                return Err(anyhow!("tracking failed entirely, no hope to recover"));
            }
            if !settings.use_imu {
                error!("tracking failed on all candidates: lost");
                self.shared.is_lost.store(true, Ordering::SeqCst);
            }
        }

        self.last_coarse_rmse = scored.achieved_res;

        // Write the tracking outputs to the shell.
        fh.aff_g2l = scored.aff_g2l;
        let cam_to_world = {
            let mut shells = self.shared.shells.lock();
            let ref_pose = shells[last_f_id.index()].cam_to_world.clone();
            let shell = &mut shells[id.index()];
            shell.cam_to_tracking_ref = scored.last_f_to_fh.inverse();
            shell.tracking_ref = Some(last_f_id);
            shell.aff_g2l = scored.aff_g2l;
            shell.cam_to_world = ref_pose.compose(&shell.cam_to_tracking_ref);
            shell.tracking_was_good = scored.tracking_good;
            shell.cam_to_world.clone()
        };

        if tracker.first_coarse_rmse() < 0.0 {
            tracker.set_first_coarse_rmse(scored.achieved_res[0]);
        }

        if !settings.debugout_runquiet {
            info!(
                a = scored.aff_g2l.a,
                b = scored.aff_g2l.b,
                exposure = fh.ab_exposure,
                rmse = scored.achieved_res[0],
                "coarse tracking"
            );
        }

        {
            let timestamp = self.shared.shells.lock()[id.index()].timestamp;
            self.shared.logs.lock().log_coarse_tracking(
                id.0,
                timestamp,
                fh.ab_exposure,
                &cam_to_world,
                scored.aff_g2l,
                scored.achieved_res[0],
                scored.try_iterations,
            );
        }

        Ok((
            [
                scored.achieved_res[0],
                scored.flow_vecs[0],
                scored.flow_vecs[1],
                scored.flow_vecs[2],
            ],
            scored.tracking_good,
        ))
    }

    /// Hand a tracked frame to the mapping worker (or run the mapping
    /// inline in deterministic mode).
    fn deliver_tracked_frame(&mut self, fh: Box<FrameHessian>, mut need_kf: bool) {
        let settings = self.settings.clone();
        let id = fh.shell_id;

        let already_prepared_kf = settings.use_imu
            && self.shared.imu.lock().prepared_keyframe() != -1
            && !settings.linearize_operation;

        if (need_kf || (!self.second_keyframe_done && !settings.linearize_operation))
            && settings.use_imu
            && !already_prepared_kf
        {
            debug!(frame = id.0, "preparing keyframe");
            self.shared.imu.lock().prepare_keyframe(id.0);
            if !need_kf {
                self.second_keyframe_done = true;
            }
        }

        if settings.linearize_operation {
            if need_kf {
                if settings.use_imu {
                    self.shared.imu.lock().keyframe_created(id.0);
                }
                mapper::make_keyframe(&self.shared, fh);
            } else {
                mapper::make_non_keyframe(&self.shared, fh);
            }
        } else {
            {
                let mut imu = self.shared.imu.lock();
                // A prepared promotion that is still queued is taken over by
                // this newer frame.
                if already_prepared_kf && !imu.is_prepared_kf_created() {
                    imu.prepare_keyframe(id.0);
                    need_kf = true;
                }
                if need_kf {
                    let after = if settings.use_imu {
                        imu.prepared_keyframe()
                    } else {
                        let shells = self.shared.shells.lock();
                        shells[id.index()].tracking_ref.map(|r| r.0).unwrap_or(-1)
                    };
                    self.shared.need_kf_after.store(after, Ordering::SeqCst);
                }
            }

            if self.tx.send(TrackedFrame::new(fh, need_kf)).is_err() {
                warn!("mapping queue closed; dropping frame");
            }
            self.shared.wait_for_tracking_reference();
        }
    }

    /// Ingest the converged initializer: install its first frame as
    /// keyframe 0 with a thinned, rescaled point set, and seed the pose of
    /// the newest frame.
    fn initialize_from_initializer(&mut self, new_frame: &mut FrameHessian) -> Result<()> {
        let settings = self.settings.clone();
        let mut state = self.shared.mapping.lock();

        let points = self.initializer.points();
        let mut first = self.initializer.take_first_frame();
        first.idx = 0;
        first.keyframe_index = 0;
        {
            let mut keyframes = self.shared.keyframes.lock();
            debug_assert!(keyframes.is_empty());
            keyframes.push(first.shell_id);
        }
        state.backend.insert_frame(&first);

        // Normalize the initializer's depth field to mean inverse depth 1.
        let mut sum_id = 1e-5f32;
        let mut num_id = 1e-5f32;
        for p in &points {
            sum_id += p.ir;
            num_id += 1.0;
        }
        let rescale_factor = 1.0 / (sum_id / num_id);

        let keep_percentage = settings.desired_point_density / points.len().max(1) as f32;
        info!(
            keep = keep_percentage * 100.0,
            have = points.len(),
            want = settings.desired_point_density,
            "initialization point thinning"
        );

        {
            let calib = self.shared.calib.read();
            let mut rng = rand::thread_rng();
            for p in &points {
                if rng.gen::<f32>() > keep_percentage {
                    continue;
                }
                let Some(mut pt) = ImmaturePoint::new(
                    p.u + 0.5,
                    p.v + 0.5,
                    p.point_type,
                    first.di(),
                    &calib,
                    &settings,
                ) else {
                    continue;
                };
                if !pt.energy_th.is_finite() {
                    continue;
                }
                pt.idepth_min = 1.0;
                pt.idepth_max = 1.0;

                let mut ph = PointHessian::from_immature(&pt, first.shell_id);
                if !ph.energy_th.is_finite() {
                    continue;
                }
                ph.set_idepth(p.ir * rescale_factor);
                ph.set_idepth_zero(ph.idepth);
                ph.has_depth_prior = true;
                ph.status = PointStatus::Active;
                state.backend.insert_point(first.shell_id);
                first.point_hessians.push(ph);
            }
        }

        let mut first_to_new = self.initializer.this_to_next();
        first_to_new.translation /= rescale_factor as f64;
        debug!(rescale_factor, "initializer rescale");

        {
            let mut shells = self.shared.shells.lock();
            let fid = first.shell_id;
            shells[fid.index()].cam_to_world = self.first_pose.clone();
            shells[fid.index()].aff_g2l = AffLight::zero();
            shells[fid.index()].tracking_ref = None;
            shells[fid.index()].cam_to_tracking_ref = SE3::identity();
            shells[fid.index()].keyframe_id = 0;
            first.set_eval_pt_scaled(
                &shells[fid.index()].cam_to_world.inverse(),
                AffLight::zero(),
            );

            let nid = new_frame.shell_id;
            shells[nid.index()].cam_to_world =
                self.first_pose.compose(&first_to_new.inverse());
            shells[nid.index()].aff_g2l = AffLight::zero();
            shells[nid.index()].tracking_ref = Some(fid);
            shells[nid.index()].cam_to_tracking_ref = first_to_new.inverse();
            new_frame.set_eval_pt_scaled(
                &shells[nid.index()].cam_to_world.inverse(),
                AffLight::zero(),
            );
        }

        let n_points = first.point_hessians.len();
        state.window.push(*first);
        {
            let shells = self.shared.shells.lock();
            let calib = self.shared.calib.read();
            mapper::set_precalc_values(&mut state, &shells, &calib);
        }
        drop(state);

        if settings.use_imu {
            let shells = self.shared.shells.lock();
            self.shared
                .imu
                .lock()
                .finish_coarse_tracking(&shells[new_frame.shell_id.index()], true);
        }

        self.initialized = true;
        info!(points = n_points, "initialized from initializer");
        Ok(())
    }

    /// Write the trajectory: one line per valid frame,
    /// `timestamp tx ty tz qx qy qz qw`, poses relative to the first
    /// keyframe.
    pub fn save_trajectory(&self, path: &Path, options: TrajectoryOptions) -> Result<()> {
        let shells = self.shared.shells.lock();
        let transform = self.shared.imu.lock().transform_dso_imu();

        let mut file = BufWriter::new(File::create(path)?);
        for s in shells.iter() {
            if !s.pose_valid {
                continue;
            }
            if options.only_log_kf_poses && s.marginalized_at == s.id.0 {
                continue;
            }

            let mut cam_to_world = s.cam_to_world.clone();
            if options.use_cam_to_tracking_ref && s.keyframe_id == -1 {
                if let Some(r) = s.tracking_ref {
                    cam_to_world = shells[r.index()]
                        .cam_to_world
                        .compose(&s.cam_to_tracking_ref);
                }
            }

            let mut cam_to_first = self.first_pose.inverse().compose(&cam_to_world);
            if options.save_metric_poses {
                let mut scaled = cam_to_world;
                scaled.translation *= transform.scale;
                cam_to_first = transform.t_dso_imu.compose(&scaled);
            }

            let t = &cam_to_first.translation;
            let q = cam_to_first.rotation.quaternion();
            writeln!(
                file,
                "{:.15} {:.15} {:.15} {:.15} {:.15} {:.15} {:.15} {:.15}",
                s.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )?;
        }
        Ok(())
    }

    /// Stop the mapping worker, drain the queue and flush logs.
    pub fn shutdown(&mut self) {
        self.shared.run_mapping.store(false, Ordering::SeqCst);
        self.shared.wake_waiters();
        if let Some(handle) = self.mapping_handle.take() {
            let _ = handle.join();
        }
        // Free frames that never reached the mapper.
        while let Ok(msg) = self.rx.try_recv() {
            drop(msg);
        }

        let shells = self.shared.shells.lock();
        if let Err(err) = self.shared.logs.lock().write_frame_lifetimes(&shells) {
            warn!(%err, "writing lifetime log failed");
        }
    }
}

impl Drop for FullSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
