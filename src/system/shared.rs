//! State shared between the tracking and mapping threads.
//!
//! Lock inventory, in acquisition order:
//! 1. `mapping` — all structural changes to the active window (frames,
//!    points, backend bookkeeping). Held by the mapping thread for the
//!    duration of a keyframe; taken transiently for tracing.
//! 2. `shells` — the frame-history arena; guards every shell's pose fields.
//!    Always taken after `mapping` when both are needed.
//! 3. The two coarse-tracker locks, taken together (in field order) only
//!    for the reference swap; individually otherwise.
//!
//! `mapped_signal` implements the bootstrap handshake: the tracking thread
//! waits on it until a tracking reference exists.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::calib::CalibHessian;
use crate::frame::{FrameId, FrameShell};
use crate::imu::ImuIntegration;
use crate::logs::DiagnosticLogs;
use crate::output::Observer;
use crate::settings::Settings;
use crate::system::mapper::MappingState;
use crate::tracking::CoarseTracker;

/// Everything both threads touch.
pub struct SharedState {
    pub settings: Arc<Settings>,
    /// Calibration: written rarely (setup, optimizer), read everywhere.
    pub calib: RwLock<CalibHessian>,

    /// Frame history arena; `shells[i].id == i`. Guards all pose fields.
    pub shells: Mutex<Vec<FrameShell>>,
    /// Shell ids of all keyframes, in creation order.
    pub keyframes: Mutex<Vec<FrameId>>,

    /// Active window and mapping collaborators.
    pub mapping: Mutex<MappingState>,

    /// The tracker the tracking thread reads.
    pub coarse_tracker: Mutex<Box<dyn CoarseTracker>>,
    /// The tracker the mapping thread re-targets after each keyframe.
    pub coarse_tracker_for_new_kf: Mutex<Box<dyn CoarseTracker>>,
    /// Lock-free mirrors of the two trackers' reference ids, used to decide
    /// when to swap without touching the tracker locks.
    pub coarse_ref_id: AtomicI64,
    pub coarse_for_kf_ref_id: AtomicI64,

    pub imu: Mutex<Box<dyn ImuIntegration>>,
    pub observers: Mutex<Vec<Box<dyn Observer>>>,
    pub logs: Mutex<DiagnosticLogs>,

    /// Mapping thread keeps running while set.
    pub run_mapping: AtomicBool,
    /// Shell id after which the mapper must create a keyframe; -1 = none.
    /// A newer tracked frame overrides a still-pending promotion.
    pub need_kf_after: AtomicI64,
    /// Queue fell behind; demote pending promotions until drained.
    pub need_to_catchup: AtomicBool,

    pub is_lost: AtomicBool,
    pub init_failed: AtomicBool,
    pub full_reset_requested: AtomicBool,

    mapped_count: Mutex<u64>,
    mapped_signal: Condvar,
}

impl SharedState {
    pub fn new(
        settings: Arc<Settings>,
        calib: CalibHessian,
        mapping: MappingState,
        coarse_tracker: Box<dyn CoarseTracker>,
        coarse_tracker_for_new_kf: Box<dyn CoarseTracker>,
        imu: Box<dyn ImuIntegration>,
        logs: DiagnosticLogs,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            calib: RwLock::new(calib),
            shells: Mutex::new(Vec::new()),
            keyframes: Mutex::new(Vec::new()),
            mapping: Mutex::new(mapping),
            coarse_tracker: Mutex::new(coarse_tracker),
            coarse_tracker_for_new_kf: Mutex::new(coarse_tracker_for_new_kf),
            coarse_ref_id: AtomicI64::new(-1),
            coarse_for_kf_ref_id: AtomicI64::new(-1),
            imu: Mutex::new(imu),
            observers: Mutex::new(Vec::new()),
            logs: Mutex::new(logs),
            run_mapping: AtomicBool::new(true),
            need_kf_after: AtomicI64::new(-1),
            need_to_catchup: AtomicBool::new(false),
            is_lost: AtomicBool::new(false),
            init_failed: AtomicBool::new(false),
            full_reset_requested: AtomicBool::new(false),
            mapped_count: Mutex::new(0),
            mapped_signal: Condvar::new(),
        })
    }

    /// Swap the two coarse trackers. Called by the tracking thread when the
    /// mapping thread finished a keyframe optimization and the stand-by
    /// tracker carries a newer reference.
    pub fn swap_coarse_trackers(&self) {
        let mut a = self.coarse_tracker.lock();
        let mut b = self.coarse_tracker_for_new_kf.lock();
        std::mem::swap(&mut *a, &mut *b);
        let ra = a.ref_frame_id();
        let rb = b.ref_frame_id();
        self.coarse_ref_id.store(ra, Ordering::SeqCst);
        self.coarse_for_kf_ref_id.store(rb, Ordering::SeqCst);
    }

    /// Signal that the mapper finished one frame.
    pub fn notify_mapped(&self) {
        let mut count = self.mapped_count.lock();
        *count += 1;
        self.mapped_signal.notify_all();
    }

    /// Block until either coarse tracker has a reference keyframe (or the
    /// session shuts down).
    pub fn wait_for_tracking_reference(&self) {
        let mut count = self.mapped_count.lock();
        while self.coarse_ref_id.load(Ordering::SeqCst) == -1
            && self.coarse_for_kf_ref_id.load(Ordering::SeqCst) == -1
            && self.keep_mapping()
        {
            self.mapped_signal.wait(&mut count);
        }
    }

    /// Wake a tracking thread blocked on the bootstrap handshake (used at
    /// shutdown).
    pub fn wake_waiters(&self) {
        let _count = self.mapped_count.lock();
        self.mapped_signal.notify_all();
    }

    pub fn is_lost(&self) -> bool {
        self.is_lost.load(Ordering::SeqCst)
    }

    pub fn init_failed(&self) -> bool {
        self.init_failed.load(Ordering::SeqCst)
    }

    pub fn reset_requested(&self) -> bool {
        self.full_reset_requested.load(Ordering::SeqCst)
    }

    pub fn keep_mapping(&self) -> bool {
        self.run_mapping.load(Ordering::SeqCst)
    }
}
