//! Camera intake threads.
//!
//! One intake thread per camera consumes the reader's frame channel, binds
//! each frame to the roller whose pitch window contains it, and pushes it
//! onto the shared dispatch queue. Frames that cannot be queued still produce
//! a failed view so the roller's verdict accounts for them.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender};
use line_ingest::{
    CameraId, CameraStream, CaptureError, Frame, LinePositionTracker, RollerEntry, RollerId,
};
use tracing::{debug, warn};

use crate::pipeline::{
    data::{AggregatorInput, PipelineEvent, ViewFailure, ViewReport},
    dispatch::{DispatchQueue, PushOutcome},
    stats::InspectionStats,
    telemetry,
    watchdog::{PauseReason, PipelineHealth},
};

const FRAME_POLL: Duration = Duration::from_millis(50);

/// Pause switches for frame intake. Intake runs only while every switch is
/// off, so an operator pause outlives a link recovery.
#[derive(Default)]
pub(crate) struct IntakeGate {
    operator: AtomicBool,
    link: AtomicBool,
}

impl IntakeGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn switch(&self, reason: PauseReason) -> &AtomicBool {
        match reason {
            PauseReason::Operator => &self.operator,
            PauseReason::LinkLoss => &self.link,
        }
    }

    /// Returns `true` if the switch changed.
    pub(crate) fn set(&self, reason: PauseReason, paused: bool) -> bool {
        self.switch(reason).swap(paused, Ordering::SeqCst) != paused
    }

    pub(crate) fn is_set(&self, reason: PauseReason) -> bool {
        self.switch(reason).load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.is_set(PauseReason::Operator) || self.is_set(PauseReason::LinkLoss)
    }

    pub(crate) fn reasons(&self) -> Vec<PauseReason> {
        [PauseReason::Operator, PauseReason::LinkLoss]
            .into_iter()
            .filter(|reason| self.is_set(*reason))
            .collect()
    }
}

/// Serialises roller entry announcements with frame assignment, so the
/// aggregator always sees a roller's entry before any view of it.
pub(crate) struct EntryAnnouncer {
    tracker: LinePositionTracker,
    tx: Sender<AggregatorInput>,
    serial: Mutex<()>,
}

impl EntryAnnouncer {
    pub(crate) fn new(tracker: LinePositionTracker, tx: Sender<AggregatorInput>) -> Self {
        Self {
            tracker,
            tx,
            serial: Mutex::new(()),
        }
    }

    pub(crate) fn tracker(&self) -> &LinePositionTracker {
        &self.tracker
    }

    /// Announce every roller that has entered the zone by `now`.
    pub(crate) fn announce(&self, now: Instant) -> usize {
        let _serial = self.serialize();
        self.announce_locked(now)
    }

    /// Register a sensor-signalled entry.
    pub(crate) fn trigger(&self, at: Instant) -> RollerEntry {
        let _serial = self.serialize();
        let entry = self.tracker.trigger_entry(at);
        self.send(entry);
        entry
    }

    /// Announce pending entries, then find the roller at `position_mm`.
    pub(crate) fn assign(&self, now: Instant, position_mm: f64) -> Option<RollerId> {
        let _serial = self.serialize();
        self.announce_locked(now);
        self.tracker.roller_at(position_mm)
    }

    fn announce_locked(&self, now: Instant) -> usize {
        let entries = self.tracker.poll_entries(now);
        let count = entries.len();
        for entry in entries {
            self.send(entry);
        }
        count
    }

    fn send(&self, entry: RollerEntry) {
        let input = AggregatorInput::Entered {
            roller_id: entry.roller_id,
            entered_at: entry.entered_at,
            entry_position_mm: entry.entry_position_mm,
        };
        if self.tx.send(input).is_err() {
            debug!(roller = %entry.roller_id, "aggregator gone; entry not announced");
        }
    }

    fn serialize(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.serial.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub(crate) struct IntakeContext {
    pub(crate) offset_mm: f64,
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) push_timeout: Duration,
    pub(crate) announcer: Arc<EntryAnnouncer>,
    pub(crate) gate: Arc<IntakeGate>,
    pub(crate) reports: Sender<AggregatorInput>,
    pub(crate) events: Sender<PipelineEvent>,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) stats: Arc<InspectionStats>,
    pub(crate) running: Arc<AtomicBool>,
}

pub(crate) fn spawn_intake(
    stream: CameraStream,
    ctx: IntakeContext,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread(format!("intake-{}", stream.camera_id.0), move || {
        let camera_id = stream.camera_id;
        while ctx.running.load(Ordering::Relaxed) {
            match stream.frames.recv_timeout(FRAME_POLL) {
                Ok(Ok(frame)) => {
                    ctx.health.beat_camera(camera_id);
                    if !ctx.on_frame(frame) {
                        break;
                    }
                }
                Ok(Err(err)) => ctx.on_capture_error(camera_id, err),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(camera = %camera_id, "camera stream ended");
                    ctx.health.camera_stopped(camera_id);
                    let _ = ctx.events.send(PipelineEvent::CameraStopped { camera_id });
                    break;
                }
            }
        }
        stream.join();
        debug!(camera = %camera_id, "intake exiting");
    })
}

impl IntakeContext {
    /// Returns `false` once the queue has closed.
    fn on_frame(&self, frame: Frame) -> bool {
        if self.gate.is_paused() {
            self.stats.frame_paused();
            return true;
        }
        let now = Instant::now();
        let roller = match frame.roller_id() {
            Some(roller_id) => {
                self.announcer.announce(now);
                Some(roller_id)
            }
            None => self
                .announcer
                .assign(now, frame.position_mm() - self.offset_mm),
        };
        let Some(roller_id) = roller else {
            debug!(
                camera = %frame.camera_id(),
                position = frame.position_mm(),
                "frame outside any roller window"
            );
            self.stats.frame_unassigned();
            return true;
        };

        match self.queue.push(frame.assigned_to(roller_id), self.push_timeout) {
            PushOutcome::Enqueued => self.stats.frame_queued(),
            PushOutcome::Evicted(old) => {
                self.stats.frame_queued();
                self.lose(old, ViewFailure::Evicted);
            }
            PushOutcome::TimedOut(frame) => self.lose(frame, ViewFailure::QueueTimeout),
            PushOutcome::Closed(_) => return false,
        }
        metrics::gauge!("inspection_queue_depth").set(self.queue.depth() as f64);
        true
    }

    fn on_capture_error(&self, camera_id: CameraId, err: CaptureError) {
        if let CaptureError::Timeout { .. } = err {
            debug!(camera = %camera_id, "{err}");
            return;
        }
        warn!(camera = %camera_id, "capture failed: {err}");
        if err.is_fatal() {
            self.health.camera_stopped(camera_id);
        }
        let _ = self.events.send(PipelineEvent::CaptureFailed {
            camera_id,
            error: err.to_string(),
        });
        if self.gate.is_paused() {
            return;
        }
        let now = Instant::now();
        let position = self.announcer.tracker().position_at(now) - self.offset_mm;
        if let Some(roller_id) = self.announcer.assign(now, position) {
            self.stats.frame_lost(ViewFailure::CaptureFailed);
            self.report_failure(roller_id, camera_id, now, ViewFailure::CaptureFailed);
        }
    }

    fn lose(&self, frame: Frame, failure: ViewFailure) {
        self.stats.frame_lost(failure);
        let Some(roller_id) = frame.roller_id() else {
            return;
        };
        let camera_id = frame.camera_id();
        debug!(roller = %roller_id, camera = %camera_id, cause = failure.label(), "frame lost");
        let _ = self.events.send(PipelineEvent::FrameDropped {
            roller_id,
            camera_id,
            failure,
        });
        self.report_failure(roller_id, camera_id, frame.captured_at(), failure);
    }

    fn report_failure(
        &self,
        roller_id: RollerId,
        camera_id: CameraId,
        captured_at: Instant,
        failure: ViewFailure,
    ) {
        let report = ViewReport::failed(roller_id, camera_id, captured_at, failure);
        if self.reports.send(AggregatorInput::Report(report)).is_err() {
            debug!(roller = %roller_id, "aggregator gone; failed view not reported");
        }
    }
}
