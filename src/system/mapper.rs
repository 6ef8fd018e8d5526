//! The mapping worker.
//!
//! Consumes tracked frames from the queue, runs the immature-point tracing
//! sweep, manages the active window (keyframe insertion, point activation,
//! marginalization flagging), invokes the backend optimizer, and re-targets
//! the stand-by coarse tracker. In deterministic mode the same entry points
//! are called inline by the tracking thread.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::calib::{CalibHessian, PATTERN_PADDING};
use crate::frame::hessian::{calib_k, calib_ki, FrameTargetPrecalc};
use crate::frame::{AffLight, FrameHessian, FrameId, FrameShell};
use crate::init::PixelSelector;
use crate::output::SystemStatus;
use crate::points::hessian::{PointFrameResidual, PointHessian, PointStatus, ResState};
use crate::points::immature::{ImmaturePoint, TemporaryResidual, TraceStatus};
use crate::settings::Settings;
use crate::system::distance_map::CoarseDistanceMap;
use crate::system::messages::TrackedFrame;
use crate::system::shared::SharedState;

/// Receive timeout so the loop can check the shutdown flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Queue length beyond which the mapper starts demoting keyframes to catch
/// up.
const CATCHUP_QUEUE_LEN: usize = 3;

/// Outcome of optimizing one immature point for activation.
pub enum ActivationOutcome {
    /// Converged: insert this point into the optimization.
    Activated(PointHessian),
    /// Diverged or unsupported: delete the candidate.
    Drop,
    /// Not conclusive yet: keep the candidate immature.
    Defer,
}

/// Active window plus the mapping collaborators, guarded by the map lock.
pub struct MappingState {
    /// Active keyframes, oldest first. `window[i].idx == i`.
    pub window: Vec<FrameHessian>,
    pub backend: Box<dyn Backend>,
    pub selector: Box<dyn PixelSelector>,
    pub distance_map: CoarseDistanceMap,
    /// Adaptive activation distance, in [0, 4].
    pub current_min_act_dist: f32,

    /// Whether the inertial-ready status was already published.
    pub imu_used_before: bool,

    pub statistics_num_created_points: usize,
    pub statistics_num_activated_points: usize,
    pub statistics_num_dropped_points: usize,
}

impl MappingState {
    pub fn new(
        backend: Box<dyn Backend>,
        selector: Box<dyn PixelSelector>,
        calib: &CalibHessian,
    ) -> Self {
        Self {
            window: Vec::new(),
            backend,
            selector,
            distance_map: CoarseDistanceMap::new(calib),
            current_min_act_dist: 2.0,
            imu_used_before: false,
            statistics_num_created_points: 0,
            statistics_num_activated_points: 0,
            statistics_num_dropped_points: 0,
        }
    }
}

/// Mapping thread main loop.
pub fn run_mapping_loop(shared: Arc<SharedState>, rx: Receiver<TrackedFrame>) {
    loop {
        if !shared.keep_mapping() {
            break;
        }
        match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(msg) => {
                process_tracked_frame(&shared, &rx, msg);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("mapping finished");
}

/// Handle one frame delivered by the tracking thread, including the
/// backpressure and keyframe-promotion-race rules.
fn process_tracked_frame(
    shared: &Arc<SharedState>,
    rx: &Receiver<TrackedFrame>,
    msg: TrackedFrame,
) {
    let settings = shared.settings.clone();
    let TrackedFrame {
        fh,
        tentative_keyframe,
    } = msg;
    let fh_id = fh.shell_id;

    debug!(
        frame = fh_id.0,
        tentative = tentative_keyframe,
        kf_after = shared.need_kf_after.load(Ordering::SeqCst),
        "mapping frame"
    );

    // The very first tracked frames always become keyframes.
    let n_keyframes = shared.keyframes.lock().len();
    if n_keyframes <= 2 {
        if settings.use_imu {
            shared.imu.lock().keyframe_created(fh_id.0);
        }
        make_keyframe(shared, fh);
        shared.notify_mapped();
        return;
    }

    if rx.len() > CATCHUP_QUEUE_LEN {
        shared.need_to_catchup.store(true, Ordering::SeqCst);
    }

    if !rx.is_empty() {
        // More frames are waiting: handle this one as a non-keyframe first.
        if settings.use_imu && shared.need_kf_after.load(Ordering::SeqCst) == fh_id.0 {
            warn!("prepared keyframe got skipped by the queue");
            shared.imu.lock().skip_prepared_keyframe();
        }

        make_non_keyframe(shared, fh);

        if shared.need_to_catchup.load(Ordering::SeqCst) {
            if let Ok(extra) = rx.try_recv() {
                // Catch up: fix the world pose and discard the frame.
                let extra = extra.fh;
                let mut shells = shared.shells.lock();
                let ref_id = shells[extra.shell_id.index()]
                    .tracking_ref
                    .expect("tracked frame without reference");
                let ref_pose = shells[ref_id.index()].cam_to_world.clone();
                let shell = &mut shells[extra.shell_id.index()];
                shell.cam_to_world = ref_pose.compose(&shell.cam_to_tracking_ref);
                debug!(frame = extra.shell_id.0, "dropped frame to catch up");
                drop(shells);
                drop(extra);
            }
        }
    } else {
        let create_kf = if settings.use_imu {
            shared.need_kf_after.load(Ordering::SeqCst) == fh_id.0
        } else {
            let state = shared.mapping.lock();
            match state.window.last() {
                Some(last) => shared.need_kf_after.load(Ordering::SeqCst) >= last.shell_id.0,
                None => false,
            }
        };

        if settings.real_time_max_kf || create_kf {
            if settings.use_imu {
                shared.imu.lock().keyframe_created(fh_id.0);
            }
            make_keyframe(shared, fh);
            shared.need_to_catchup.store(false, Ordering::SeqCst);
        } else {
            make_non_keyframe(shared, fh);
        }
    }
    shared.notify_mapped();
}

/// Materialize the frame's world pose, trace immature points against it,
/// and discard the heavy state.
pub fn make_non_keyframe(shared: &SharedState, mut fh: Box<FrameHessian>) {
    {
        let mut shells = shared.shells.lock();
        let ref_id = shells[fh.shell_id.index()]
            .tracking_ref
            .expect("tracked frame without reference");
        let ref_pose = shells[ref_id.index()].cam_to_world.clone();
        let shell = &mut shells[fh.shell_id.index()];
        shell.cam_to_world = ref_pose.compose(&shell.cam_to_tracking_ref);
        fh.set_eval_pt_scaled(&shell.cam_to_world.inverse(), shell.aff_g2l);
    }

    let mut state = shared.mapping.lock();
    let calib = shared.calib.read();
    trace_new_coarse(&mut state, &fh, &calib, &shared.settings);
}

/// Full keyframe path: tracing, window insertion, activation, optimization,
/// marginalization and re-seeding.
pub fn make_keyframe(shared: &SharedState, mut fh: Box<FrameHessian>) {
    let settings = shared.settings.clone();

    {
        let mut shells = shared.shells.lock();
        let ref_id = shells[fh.shell_id.index()].tracking_ref;
        if let Some(ref_id) = ref_id {
            let ref_pose = shells[ref_id.index()].cam_to_world.clone();
            let shell = &mut shells[fh.shell_id.index()];
            shell.cam_to_world = ref_pose.compose(&shell.cam_to_tracking_ref);
        }
        let shell = &mut shells[fh.shell_id.index()];
        fh.set_eval_pt_scaled(&shell.cam_to_world.inverse(), shell.aff_g2l);
    }

    let mut state = shared.mapping.lock();
    {
        let calib = shared.calib.read();
        trace_new_coarse(&mut state, &fh, &calib, &settings);
    }

    // Flag frames to be marginalized after this keyframe.
    flag_frames_for_marginalization(&mut state, &settings);

    // Insert the new frame into the window.
    let new_id = fh.shell_id;
    let keyframe_index;
    {
        let mut keyframes = shared.keyframes.lock();
        keyframe_index = keyframes.len() as i64;
        keyframes.push(new_id);
    }
    fh.idx = state.window.len();
    fh.keyframe_index = keyframe_index;
    {
        let mut shells = shared.shells.lock();
        shells[new_id.index()].keyframe_id = keyframe_index;
    }
    state.backend.insert_frame(&fh);
    let inherited_energy_th = state
        .window
        .last()
        .map(|f| f.frame_energy_th)
        .unwrap_or(fh.frame_energy_th);
    fh.frame_energy_th = inherited_energy_th;
    state.window.push(*fh);

    {
        let shells = shared.shells.lock();
        let calib = shared.calib.read();
        set_precalc_values(&mut state, &shells, &calib);
    }

    // Add residuals of all existing active points against the new frame.
    {
        let MappingState {
            ref mut window,
            ref mut backend,
            ..
        } = *state;
        let n = window.len();
        let mut num_fwd_res_added = 0usize;
        for host in window[..n - 1].iter_mut() {
            let host_id = host.shell_id;
            for ph in host.point_hessians.iter_mut() {
                let r = PointFrameResidual::new(host_id, new_id);
                backend.insert_residual(&r);
                ph.residuals.push(r);
                ph.last_residuals[1] = ph.last_residuals[0];
                ph.last_residuals[0] = (Some(new_id), ResState::In);
                num_fwd_res_added += 1;
            }
        }
        debug!(residuals = num_fwd_res_added, "seeded residuals for new keyframe");
    }

    // Activate mature candidates.
    activate_points(shared, &mut state);

    // Window optimization.
    let rmse = {
        let mut calib = shared.calib.write();
        let MappingState {
            ref mut window,
            ref mut backend,
            ..
        } = *state;
        backend.optimize(window, &mut calib, settings.max_opt_iterations)
    };
    debug!(keyframe = keyframe_index, rmse, "window optimized");

    // Initialization sanity gates on the first few keyframes.
    let n_keyframes = shared.keyframes.lock().len();
    if n_keyframes <= 4 {
        let slack = settings.benchmark_initializer_slack_factor;
        let limit = match n_keyframes {
            2 => Some(20.0 * slack),
            3 => Some(13.0 * slack),
            4 => Some(9.0 * slack),
            _ => None,
        };
        if let Some(limit) = limit {
            if rmse > limit {
                warn!(rmse, limit, "initialization failed, requesting reset");
                shared.init_failed.store(true, Ordering::SeqCst);
            }
        }
    }

    remove_outliers(&mut state);

    if settings.use_imu {
        shared.imu.lock().post_optimization(new_id.0);
    }

    // Re-target the stand-by coarse tracker.
    let imu_ready = {
        let mut tracker = shared.coarse_tracker_for_new_kf.lock();
        let imu_ready = if settings.use_imu {
            shared.imu.lock().finish_keyframe_optimization(new_id.0)
        } else {
            false
        };
        let shells = shared.shells.lock();
        let calib = shared.calib.read();
        tracker.set_reference(&state.window, &shells, &calib);
        shared
            .coarse_for_kf_ref_id
            .store(tracker.ref_frame_id(), Ordering::SeqCst);
        imu_ready
    };

    {
        let mut observers = shared.observers.lock();
        if imu_ready && !state.imu_used_before {
            for ow in observers.iter_mut() {
                ow.publish_system_status(SystemStatus::VisualInertial);
            }
        }
        if settings.use_imu {
            let transform = shared.imu.lock().transform_dso_imu();
            for ow in observers.iter_mut() {
                ow.publish_transform_dso_imu(&transform);
            }
        }
    }
    state.imu_used_before = imu_ready;

    // Flag and remove points ahead of frame marginalization.
    {
        let calib = shared.calib.read();
        flag_points_for_removal(&mut state, &calib, &settings);
    }

    // Seed new immature points on the newest keyframe.
    {
        let calib = shared.calib.read();
        make_new_points(&mut state, &calib, &settings);
    }

    // Publish window contents and connectivity.
    {
        let shells = shared.shells.lock();
        let calib = shared.calib.read();
        let connectivity = state.backend.connectivity();
        let mut observers = shared.observers.lock();
        for ow in observers.iter_mut() {
            ow.publish_graph(&connectivity);
            ow.publish_keyframes(&state.window, &shells, &calib);
        }
    }

    // Marginalize flagged frames.
    let mut i = 0;
    while i < state.window.len() {
        if state.window[i].flagged_for_marginalization {
            marginalize_frame(shared, &mut state, i);
            i = 0;
        } else {
            i += 1;
        }
    }

    // Diagnostics.
    {
        let shells = shared.shells.lock();
        let window_span = match (state.window.first(), state.window.last()) {
            (Some(first), Some(last)) => last.shell_id.0 - first.shell_id.0,
            _ => 0,
        };
        let newest_aff = state
            .window
            .last()
            .map(|f| f.aff_g2l)
            .unwrap_or(AffLight::zero());
        if !settings.debugout_runquiet {
            info!(
                keyframe = keyframe_index,
                rmse,
                window = state.window.len(),
                span = window_span,
                points = state.backend.n_points(),
                "keyframe finished"
            );
        }
        let mut logs = shared.logs.lock();
        let calib = shared.calib.read();
        logs.log_calib(keyframe_index, &calib);
        logs.log_nums(
            keyframe_index,
            rmse,
            state.statistics_num_created_points,
            state.statistics_num_activated_points,
            state.statistics_num_dropped_points,
            settings.max_opt_iterations,
            state.backend.residual_counts(),
            newest_aff,
            window_span,
            state.window.len(),
        );
        if let Some(spectrum) = state.backend.spectrum() {
            logs.log_spectrum(keyframe_index, &spectrum);
        }
        drop(shells);
    }

    if settings.use_imu {
        shared.imu.lock().finish_keyframe_operations(new_id.0);
    }
}

/// Run the epipolar tracer of every immature point in the window against a
/// newly tracked frame.
pub fn trace_new_coarse(
    state: &mut MappingState,
    fh: &FrameHessian,
    calib: &CalibHessian,
    settings: &Settings,
) {
    let k = calib_k(calib);
    let ki = calib_ki(calib);

    let mut counts = [0usize; 6];
    for host in state.window.iter_mut() {
        let host_to_new = fh.pre_world_to_cam.compose(&host.pre_cam_to_world);
        let r: Matrix3<f32> = host_to_new.rotation_matrix().cast();
        let t: Vector3<f32> = host_to_new.translation.cast();
        let krki = k * r * ki;
        let kt = k * t;

        let aff = AffLight::from_to_vec_exposure(
            host.ab_exposure,
            fh.ab_exposure,
            host.aff_g2l,
            fh.aff_g2l,
        );
        let aff = [aff[0] as f32, aff[1] as f32];

        for p in host.immature_points.iter_mut() {
            let status = p.trace_on(fh.di(), &krki, &kt, aff, calib, settings);
            let slot = match status {
                TraceStatus::Good => 0,
                TraceStatus::Skipped => 1,
                TraceStatus::BadCondition => 2,
                TraceStatus::Oob => 3,
                TraceStatus::Outlier => 4,
                TraceStatus::Uninitialized => 5,
            };
            counts[slot] += 1;
        }
    }
    debug!(
        good = counts[0],
        skipped = counts[1],
        badcondition = counts[2],
        oob = counts[3],
        outlier = counts[4],
        uninitialized = counts[5],
        "traced frame {}",
        fh.shell_id
    );
}

/// Refresh cached poses from the shells and rebuild every (host, target)
/// precalc entry.
pub fn set_precalc_values(state: &mut MappingState, shells: &[FrameShell], calib: &CalibHessian) {
    for f in state.window.iter_mut() {
        let s = &shells[f.shell_id.index()];
        f.set_pose(&s.cam_to_world.inverse());
        f.aff_g2l = s.aff_g2l;
    }

    let n = state.window.len();
    let mut all: Vec<Vec<FrameTargetPrecalc>> = Vec::with_capacity(n);
    for h in 0..n {
        let mut row = Vec::with_capacity(n);
        for t in 0..n {
            row.push(FrameTargetPrecalc::set(
                &state.window[h],
                &state.window[t],
                t,
                calib,
            ));
        }
        all.push(row);
    }
    for (f, row) in state.window.iter_mut().zip(all) {
        f.target_precalc = row;
    }
}

/// Density-controlled activation of mature immature points, with the
/// distance map enforcing spatial spread. Candidate optimization runs as a
/// fork-join over worker threads.
pub fn activate_points(shared: &SharedState, state: &mut MappingState) {
    let settings = &shared.settings;
    let n_points = state.backend.n_points() as f32;
    let desired = settings.desired_point_density;

    if n_points < desired * 0.66 {
        state.current_min_act_dist -= 0.8;
    }
    if n_points < desired * 0.8 {
        state.current_min_act_dist -= 0.5;
    } else if n_points < desired * 0.9 {
        state.current_min_act_dist -= 0.2;
    } else if n_points < desired {
        state.current_min_act_dist -= 0.1;
    }

    if n_points > desired * 1.5 {
        state.current_min_act_dist += 0.8;
    }
    if n_points > desired * 1.3 {
        state.current_min_act_dist += 0.5;
    }
    if n_points > desired * 1.15 {
        state.current_min_act_dist += 0.2;
    }
    if n_points > desired {
        state.current_min_act_dist += 0.1;
    }
    state.current_min_act_dist = state.current_min_act_dist.clamp(0.0, 4.0);

    if !settings.debugout_runquiet {
        debug!(
            min_act_dist = state.current_min_act_dist,
            have = n_points,
            want = desired,
            "sparsity control"
        );
    }

    let calib = shared.calib.read();
    let n = state.window.len();
    if n == 0 {
        return;
    }

    let MappingState {
        ref mut window,
        ref mut distance_map,
        ref mut backend,
        current_min_act_dist,
        ref mut statistics_num_activated_points,
        ..
    } = *state;

    distance_map.make_k(&calib);
    distance_map.make_distance_map(window);

    // Per-host removal marks, and the candidate list for optimization.
    let mut remove: Vec<Vec<bool>> = window
        .iter()
        .map(|f| vec![false; f.immature_points.len()])
        .collect();
    let mut to_optimize: Vec<(usize, usize)> = Vec::with_capacity(2000);

    let newest_idx = n - 1;
    for h in 0..n {
        if h == newest_idx {
            continue;
        }
        let fh_to_new = window[newest_idx]
            .pre_world_to_cam
            .compose(&window[h].pre_cam_to_world);
        let r: Matrix3<f32> = fh_to_new.rotation_matrix().cast();
        let t: Vector3<f32> = fh_to_new.translation.cast();
        let krki = distance_map.k1 * r * distance_map.ki0;
        let kt = distance_map.k1 * t;

        for i in 0..window[h].immature_points.len() {
            let p = &window[h].immature_points[i];

            // Never traced successfully, or outlier on the last trace.
            if !p.idepth_max.is_finite() || p.last_trace_status == TraceStatus::Outlier {
                remove[h][i] = true;
                continue;
            }

            let can_activate = matches!(
                p.last_trace_status,
                TraceStatus::Good
                    | TraceStatus::Skipped
                    | TraceStatus::BadCondition
                    | TraceStatus::Oob
            ) && p.last_trace_pixel_interval < 8.0
                && p.quality > settings.min_trace_quality
                && (p.idepth_max + p.idepth_min) > 0.0;

            if !can_activate {
                // Delete points that would leave the window anyway.
                if window[h].flagged_for_marginalization
                    || p.last_trace_status == TraceStatus::Oob
                {
                    remove[h][i] = true;
                }
                continue;
            }

            // Spread control on the distance map.
            let ptp = krki * Vector3::new(p.u, p.v, 1.0)
                + kt * (0.5 * (p.idepth_max + p.idepth_min));
            let u1 = (ptp[0] / ptp[2] + 0.5) as i32;
            let v1 = (ptp[1] / ptp[2] + 0.5) as i32;

            if u1 > 0
                && v1 > 0
                && (u1 as usize) < distance_map.w1
                && (v1 as usize) < distance_map.h1
            {
                let dist = distance_map.value(u1, v1) as f32 + (ptp[0] - ptp[0].floor());
                if dist >= current_min_act_dist * p.point_type {
                    distance_map.add_into_dist(u1, v1);
                    to_optimize.push((h, i));
                }
            } else {
                remove[h][i] = true;
            }
        }
    }

    // Fork-join optimization of all scheduled candidates.
    let window_ref: &[FrameHessian] = window;
    let outcomes: Vec<ActivationOutcome> = to_optimize
        .par_iter()
        .with_min_len(50)
        .map(|&(h, i)| {
            optimize_immature_point(
                &window_ref[h].immature_points[i],
                h,
                window_ref,
                &calib,
                settings,
            )
        })
        .collect();

    for (&(h, i), outcome) in to_optimize.iter().zip(outcomes) {
        match outcome {
            ActivationOutcome::Activated(ph) => {
                backend.insert_point(ph.host_id);
                for r in &ph.residuals {
                    backend.insert_residual(r);
                }
                window[h].point_hessians.push(ph);
                remove[h][i] = true;
                *statistics_num_activated_points += 1;
            }
            ActivationOutcome::Drop => {
                remove[h][i] = true;
            }
            ActivationOutcome::Defer => {
                if window[h].immature_points[i].last_trace_status == TraceStatus::Oob {
                    remove[h][i] = true;
                }
            }
        }
    }

    // Compact the immature-point vectors.
    for (f, marks) in window.iter_mut().zip(remove) {
        let mut it = marks.into_iter();
        f.immature_points.retain(|_| !it.next().unwrap());
    }
}

/// Damped 1-D Gauss-Newton on the inverse depth of a candidate, evaluated
/// against every other window frame.
pub fn optimize_immature_point(
    point: &ImmaturePoint,
    host_idx: usize,
    window: &[FrameHessian],
    calib: &CalibHessian,
    settings: &Settings,
) -> ActivationOutcome {
    let host = &window[host_idx];
    let mut residuals: Vec<TemporaryResidual> = (0..window.len())
        .filter(|&t| t != host_idx)
        .map(TemporaryResidual::new)
        .collect();

    let mut current_idepth = 0.5 * (point.idepth_max + point.idepth_min);
    let mut last_energy = 0.0f32;
    let mut last_hdd = 0.0f32;
    let mut last_bd = 0.0f32;
    for r in residuals.iter_mut() {
        last_energy += point.linearize_residual(
            calib,
            settings,
            1000.0,
            &host.target_precalc[r.target_idx],
            window[r.target_idx].di(),
            r,
            &mut last_hdd,
            &mut last_bd,
            current_idepth,
        );
        r.apply();
    }

    if !last_energy.is_finite() || last_hdd < settings.min_idepth_h_act {
        return ActivationOutcome::Defer;
    }

    let mut lambda = 0.1f32;
    for _ in 0..settings.gn_its_on_point_activation {
        let h = last_hdd * (1.0 + lambda);
        let step = (1.0 / h) * last_bd;
        let new_idepth = current_idepth - step;

        let mut new_hdd = 0.0f32;
        let mut new_bd = 0.0f32;
        let mut new_energy = 0.0f32;
        for r in residuals.iter_mut() {
            new_energy += point.linearize_residual(
                calib,
                settings,
                1.0,
                &host.target_precalc[r.target_idx],
                window[r.target_idx].di(),
                r,
                &mut new_hdd,
                &mut new_bd,
                new_idepth,
            );
        }

        if !new_energy.is_finite() || new_hdd < settings.min_idepth_h_act {
            return ActivationOutcome::Defer;
        }

        if new_energy < last_energy {
            current_idepth = new_idepth;
            last_hdd = new_hdd;
            last_bd = new_bd;
            last_energy = new_energy;
            for r in residuals.iter_mut() {
                r.apply();
            }
            lambda *= 0.5;
        } else {
            lambda *= 5.0;
        }

        if step.abs() < 0.0001 * current_idepth {
            break;
        }
    }

    if !current_idepth.is_finite() {
        return ActivationOutcome::Drop;
    }

    let num_good = residuals
        .iter()
        .filter(|r| r.state == ResState::In)
        .count();
    if num_good < 1 {
        return ActivationOutcome::Drop;
    }

    let mut ph = PointHessian::from_immature(point, host.shell_id);
    ph.set_idepth(current_idepth);
    ph.set_idepth_zero(current_idepth);
    ph.idepth_hessian = last_hdd;
    ph.status = PointStatus::Active;

    let newest = window.len() - 1;
    for r in &residuals {
        if r.state != ResState::In {
            continue;
        }
        let target_id = window[r.target_idx].shell_id;
        let mut pfr = PointFrameResidual::new(host.shell_id, target_id);
        pfr.state = ResState::In;
        ph.residuals.push(pfr);

        if r.target_idx == newest {
            ph.last_residuals[0] = (Some(target_id), ResState::In);
        } else if window.len() >= 2 && r.target_idx == newest - 1 {
            ph.last_residuals[1] = (Some(target_id), ResState::In);
        }
    }

    ActivationOutcome::Activated(ph)
}

/// Walk every active point and flag it DROP or MARGINALIZE ahead of frame
/// marginalization, relinearizing the residuals of surviving inliers.
pub fn flag_points_for_removal(state: &mut MappingState, calib: &CalibHessian, settings: &Settings) {
    let MappingState {
        ref mut window,
        ref mut backend,
        ref mut statistics_num_dropped_points,
        ..
    } = *state;

    let marg_ids: Vec<FrameId> = window
        .iter()
        .filter(|f| f.flagged_for_marginalization)
        .map(|f| f.shell_id)
        .collect();
    let id_to_idx: HashMap<FrameId, usize> = window
        .iter()
        .enumerate()
        .map(|(i, f)| (f.shell_id, i))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Decision {
        Drop,
        Marginalize,
    }

    // Pass 1: classify, relinearizing inliers read-only.
    let mut decisions: Vec<(usize, usize, Decision, Vec<(usize, ResState, f32)>)> = Vec::new();
    for (h, host) in window.iter().enumerate() {
        for (i, ph) in host.point_hessians.iter().enumerate() {
            if ph.idepth < settings.min_idepth || ph.residuals.is_empty() {
                decisions.push((h, i, Decision::Drop, Vec::new()));
                continue;
            }

            if ph.is_oob(&marg_ids, settings) || host.flagged_for_marginalization {
                if ph.is_inlier_new(settings) {
                    let mut updates = Vec::with_capacity(ph.residuals.len());
                    for (ri, r) in ph.residuals.iter().enumerate() {
                        let Some(&t_idx) = id_to_idx.get(&r.target_id) else {
                            continue;
                        };
                        let mut rr = r.clone();
                        rr.state = ResState::In;
                        rr.energy = 0.0;
                        rr.linearize(
                            ph,
                            calib,
                            settings,
                            &host.target_precalc[t_idx],
                            window[t_idx].di(),
                        );
                        updates.push((ri, rr.new_state, rr.new_energy));
                    }
                    let decision = if ph.idepth_hessian > settings.min_idepth_h_marg {
                        Decision::Marginalize
                    } else {
                        Decision::Drop
                    };
                    decisions.push((h, i, decision, updates));
                } else {
                    decisions.push((h, i, Decision::Drop, Vec::new()));
                }
            }
        }
    }

    // Pass 2: apply residual updates and move the points out, highest
    // indices first so the removals stay valid.
    decisions.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
    for (h, i, decision, updates) in decisions {
        {
            let ph = &mut window[h].point_hessians[i];
            for (ri, new_state, new_energy) in updates {
                ph.residuals[ri].new_state = new_state;
                ph.residuals[ri].new_energy = new_energy;
                ph.residuals[ri].apply();
            }
        }
        let mut ph = window[h].point_hessians.swap_remove(i);
        match decision {
            Decision::Drop => {
                ph.status = PointStatus::Drop;
                backend.drop_point(ph.host_id);
                *statistics_num_dropped_points += 1;
                window[h].point_hessians_out.push(ph);
            }
            Decision::Marginalize => {
                ph.status = PointStatus::Marginalized;
                backend.marginalize_point(ph.host_id);
                window[h].point_hessians_marginalized.push(ph);
            }
        }
    }
}

/// Drop points that lost all their residuals during optimization.
pub fn remove_outliers(state: &mut MappingState) {
    let MappingState {
        ref mut window,
        ref mut backend,
        ref mut statistics_num_dropped_points,
        ..
    } = *state;

    for host in window.iter_mut() {
        let mut i = 0;
        while i < host.point_hessians.len() {
            if host.point_hessians[i].residuals.is_empty() {
                let mut ph = host.point_hessians.swap_remove(i);
                ph.status = PointStatus::Drop;
                backend.drop_point(ph.host_id);
                *statistics_num_dropped_points += 1;
                host.point_hessians_out.push(ph);
            } else {
                i += 1;
            }
        }
    }
}

/// Select window frames to marginalize: frames that lost most of their
/// points or drifted photometrically, plus (if the window is still full)
/// the frame with the worst spatial distribution score.
pub fn flag_frames_for_marginalization(state: &mut MappingState, settings: &Settings) {
    let window = &mut state.window;
    let n = window.len();
    if n == 0 {
        return;
    }

    let newest_exposure = window[n - 1].ab_exposure;
    let newest_aff = window[n - 1].aff_g2l;
    let newest_kf_index = window[n - 1].keyframe_index;

    let mut flagged = 0usize;

    // Frames with too few surviving points or a large brightness gap.
    for i in 0..n {
        let fh = &window[i];
        let points_in = fh.point_hessians.len() + fh.immature_points.len();
        let points_out = fh.point_hessians_marginalized.len() + fh.point_hessians_out.len();
        let ref_to_fh = AffLight::from_to_vec_exposure(
            newest_exposure,
            fh.ab_exposure,
            newest_aff,
            fh.aff_g2l,
        );

        if ((points_in as f32) < settings.min_points_remaining * (points_in + points_out) as f32
            || (ref_to_fh[0].ln().abs() as f32) > settings.max_log_aff_fac_in_window)
            && n - flagged > settings.min_frames
        {
            window[i].flagged_for_marginalization = true;
            flagged += 1;
        }
    }

    // Still too many frames: drop the one with the worst distance score.
    if n - flagged >= settings.max_frames {
        let mut smallest_score = 1.0f64;
        let mut to_marginalize = None;
        for (i, fh) in window.iter().enumerate() {
            if fh.keyframe_index > newest_kf_index - settings.min_frame_age
                || fh.keyframe_index == 0
            {
                continue;
            }

            let mut dist_score = 0.0f64;
            for (t, pc) in fh.target_precalc.iter().enumerate() {
                if t == i {
                    continue;
                }
                if window[t].keyframe_index > newest_kf_index - settings.min_frame_age + 1 {
                    continue;
                }
                dist_score += 1.0 / (1e-5 + pc.distance_ll as f64);
            }
            if let Some(last_pc) = fh.target_precalc.last() {
                dist_score *= -(last_pc.distance_ll as f64).sqrt();
            }

            if dist_score < smallest_score {
                smallest_score = dist_score;
                to_marginalize = Some(i);
            }
        }
        if let Some(i) = to_marginalize {
            window[i].flagged_for_marginalization = true;
            flagged += 1;
        }
    }

    if flagged > 0 {
        debug!(flagged, window = n, "flagged frames for marginalization");
    }
}

/// Remove one frame from the window: drop every residual targeting it,
/// notify the backend, stamp the shell, and rebuild the precalc caches.
pub fn marginalize_frame(shared: &SharedState, state: &mut MappingState, idx: usize) {
    let marg_id;
    let newest_id;
    {
        let MappingState {
            ref mut window,
            ref mut backend,
            ..
        } = *state;

        marg_id = window[idx].shell_id;
        newest_id = window.last().map(|f| f.shell_id).unwrap_or(marg_id);

        for (h, host) in window.iter_mut().enumerate() {
            if h == idx {
                continue;
            }
            let host_id = host.shell_id;
            for ph in host.point_hessians.iter_mut() {
                let before = ph.residuals.len();
                ph.residuals.retain(|r| r.target_id != marg_id);
                for _ in ph.residuals.len()..before {
                    backend.drop_residual(host_id, marg_id);
                }
                for slot in ph.last_residuals.iter_mut() {
                    if slot.0 == Some(marg_id) {
                        slot.0 = None;
                    }
                }
            }
        }

        backend.marginalize_frame(marg_id);
    }

    {
        let mut shells = shared.shells.lock();
        shells[marg_id.index()].marginalized_at = newest_id.0;
    }

    let fh = state.window.remove(idx);
    debug_assert!(
        fh.point_hessians.is_empty(),
        "marginalized frame still hosts active points"
    );
    debug!(frame = marg_id.0, "marginalized frame");
    drop(fh);

    for (j, f) in state.window.iter_mut().enumerate() {
        f.idx = j;
    }

    let shells = shared.shells.lock();
    let calib = shared.calib.read();
    set_precalc_values(state, &shells, &calib);
}

/// Seed fresh immature points on the newest keyframe from the pixel
/// selector's map.
pub fn make_new_points(state: &mut MappingState, calib: &CalibHessian, settings: &Settings) {
    let MappingState {
        ref mut window,
        ref mut selector,
        ref mut statistics_num_created_points,
        ..
    } = *state;

    let Some(newest) = window.last_mut() else {
        return;
    };

    let selection = selector.make_maps(newest, calib, settings.desired_immature_num);
    let (w0, h0) = (calib.w[0], calib.h[0]);
    let pp = PATTERN_PADDING as usize;

    let mut created = 0usize;
    for y in (pp + 1)..(h0 - pp - 2) {
        for x in (pp + 1)..(w0 - pp - 2) {
            let i = x + y * w0;
            if selection[i] == 0.0 {
                continue;
            }
            if let Some(p) =
                ImmaturePoint::new(x as f32, y as f32, selection[i], newest.di(), calib, settings)
            {
                newest.immature_points.push(p);
                created += 1;
            }
        }
    }
    *statistics_num_created_points += created;
    debug!(created, frame = newest.shell_id.0, "seeded immature points");
}
