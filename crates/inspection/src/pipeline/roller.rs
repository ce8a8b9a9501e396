//! Per-roller state and the table that owns it.
//!
//! A roller moves through `Collecting -> Deciding -> Decided` and then ends in
//! either `Actuated` or `Dropped`. Transitions only ever move forward and a
//! verdict, once set, is never replaced. Each context sits behind its own
//! mutex so the aggregator and the lifetime sweep never contend on the whole
//! table.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use defect_core::Detection;
use line_ingest::{CameraId, Frame, RollerId};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::{
    data::{RollerOutcome, Verdict, ViewFailure, ViewOutcome, ViewReport},
    dispatch::EvictionPolicy,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollerState {
    Collecting,
    Deciding,
    Decided,
    Actuated,
    Dropped,
}

impl RollerState {
    fn rank(self) -> u8 {
        match self {
            RollerState::Collecting => 0,
            RollerState::Deciding => 1,
            RollerState::Decided => 2,
            RollerState::Actuated | RollerState::Dropped => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub fn accepts_reports(self) -> bool {
        matches!(self, RollerState::Collecting | RollerState::Deciding)
    }

    fn can_advance_to(self, next: RollerState) -> bool {
        next.rank() == self.rank() + 1
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RollerError {
    #[error("roller {roller_id}: illegal transition {from:?} -> {to:?}")]
    Transition {
        roller_id: RollerId,
        from: RollerState,
        to: RollerState,
    },
    #[error("roller {roller_id} no longer accepts reports (state {state:?})")]
    LateReport {
        roller_id: RollerId,
        state: RollerState,
    },
    #[error("camera {camera_id} is not expected to view roller {roller_id}")]
    UnexpectedCamera {
        roller_id: RollerId,
        camera_id: CameraId,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum ViewState {
    Reported(Vec<Detection>),
    Failed(ViewFailure),
}

pub struct RollerContext {
    roller_id: RollerId,
    expected: BTreeSet<CameraId>,
    created_at: Instant,
    entry_position_mm: f64,
    state: RollerState,
    degraded: bool,
    views: BTreeMap<CameraId, ViewState>,
    verdict: Option<Arc<Verdict>>,
    decided_at: Option<Instant>,
    fire_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl RollerContext {
    pub fn new(
        roller_id: RollerId,
        expected: BTreeSet<CameraId>,
        created_at: Instant,
        entry_position_mm: f64,
    ) -> Self {
        Self {
            roller_id,
            expected,
            created_at,
            entry_position_mm,
            state: RollerState::Collecting,
            degraded: false,
            views: BTreeMap::new(),
            verdict: None,
            decided_at: None,
            fire_at: None,
            finished_at: None,
        }
    }

    pub fn roller_id(&self) -> RollerId {
        self.roller_id
    }

    pub fn state(&self) -> RollerState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn entry_position_mm(&self) -> f64 {
        self.entry_position_mm
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn verdict(&self) -> Option<&Arc<Verdict>> {
        self.verdict.as_ref()
    }

    pub fn decided_at(&self) -> Option<Instant> {
        self.decided_at
    }

    /// When the actuator fires for this roller, once a command is scheduled.
    pub fn fire_at(&self) -> Option<Instant> {
        self.fire_at
    }

    pub fn schedule_fire(&mut self, at: Instant) {
        self.fire_at = Some(at);
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn expected_cameras(&self) -> &BTreeSet<CameraId> {
        &self.expected
    }

    /// Cameras that delivered detections, possibly none.
    pub fn reported_cameras(&self) -> Vec<CameraId> {
        self.views
            .iter()
            .filter(|(_, view)| matches!(view, ViewState::Reported(_)))
            .map(|(camera, _)| *camera)
            .collect()
    }

    /// Expected cameras without a successful report.
    pub fn missing_cameras(&self) -> Vec<CameraId> {
        self.expected
            .iter()
            .filter(|camera| !matches!(self.views.get(camera), Some(ViewState::Reported(_))))
            .copied()
            .collect()
    }

    pub fn detections(&self) -> impl Iterator<Item = &Detection> {
        self.views.values().flat_map(|view| match view {
            ViewState::Reported(detections) => detections.as_slice(),
            ViewState::Failed(_) => &[],
        })
    }

    /// Every expected camera has either reported or failed.
    pub fn all_views_settled(&self) -> bool {
        self.expected
            .iter()
            .all(|camera| self.views.contains_key(camera))
    }

    /// Whether a camera other than `camera_id` has already reported.
    pub fn has_partial_results_besides(&self, camera_id: CameraId) -> bool {
        self.views
            .iter()
            .any(|(camera, view)| *camera != camera_id && matches!(view, ViewState::Reported(_)))
    }

    /// Merge one view report. A later success replaces an earlier failure
    /// from the same camera; detections from repeated frames accumulate.
    pub fn record(&mut self, report: ViewReport) -> Result<(), RollerError> {
        if !self.state.accepts_reports() {
            return Err(RollerError::LateReport {
                roller_id: self.roller_id,
                state: self.state,
            });
        }
        if !self.expected.contains(&report.camera_id) {
            return Err(RollerError::UnexpectedCamera {
                roller_id: self.roller_id,
                camera_id: report.camera_id,
            });
        }
        match report.outcome {
            ViewOutcome::Detections(detections) => match self.views.get_mut(&report.camera_id) {
                Some(ViewState::Reported(existing)) => existing.extend(detections),
                _ => {
                    self.views
                        .insert(report.camera_id, ViewState::Reported(detections));
                }
            },
            ViewOutcome::Failed(failure) => {
                if failure.is_backpressure() {
                    self.degraded = true;
                }
                self.views
                    .entry(report.camera_id)
                    .or_insert(ViewState::Failed(failure));
            }
        }
        Ok(())
    }

    fn advance(&mut self, next: RollerState) -> Result<(), RollerError> {
        if !self.state.can_advance_to(next) {
            return Err(RollerError::Transition {
                roller_id: self.roller_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn begin_deciding(&mut self) -> Result<(), RollerError> {
        self.advance(RollerState::Deciding)
    }

    /// Attach the verdict. Only legal once, from `Deciding`.
    pub fn decide(&mut self, verdict: Verdict, at: Instant) -> Result<Arc<Verdict>, RollerError> {
        self.advance(RollerState::Decided)?;
        let verdict = Arc::new(verdict);
        self.verdict = Some(verdict.clone());
        self.decided_at = Some(at);
        Ok(verdict)
    }

    pub fn finish(&mut self, outcome: &RollerOutcome, at: Instant) -> Result<(), RollerError> {
        let next = match outcome {
            RollerOutcome::Actuated { .. } => RollerState::Actuated,
            RollerOutcome::Dropped { .. } => RollerState::Dropped,
        };
        self.advance(next)?;
        self.finished_at = Some(at);
        Ok(())
    }
}

pub type RollerHandle = Arc<Mutex<RollerContext>>;

/// Arena of live roller contexts keyed by id.
#[derive(Default)]
pub struct RollerTable {
    entries: RwLock<BTreeMap<RollerId, RollerHandle>>,
    /// One past the highest roller id ever inserted. Ids are assigned in
    /// entry order, so an absent id below it belongs to a retired roller.
    entered_below: AtomicU64,
}

impl RollerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the roller is already tracked.
    pub fn insert(&self, context: RollerContext) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.contains_key(&context.roller_id) {
            return false;
        }
        self.entered_below
            .fetch_max(context.roller_id.0.saturating_add(1), Ordering::SeqCst);
        entries.insert(context.roller_id, Arc::new(Mutex::new(context)));
        true
    }

    pub fn get(&self, roller_id: RollerId) -> Option<RollerHandle> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(&roller_id).cloned()
    }

    /// Run `f` with the roller's context locked.
    pub fn with_entry<R>(
        &self,
        roller_id: RollerId,
        f: impl FnOnce(&mut RollerContext) -> R,
    ) -> Option<R> {
        let handle = self.get(roller_id)?;
        let mut context = lock(&handle);
        Some(f(&mut context))
    }

    pub fn ids(&self) -> Vec<RollerId> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.keys().copied().collect()
    }

    pub fn remove(&self, roller_id: RollerId) -> Option<RollerHandle> {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(&roller_id)
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, roller_id: RollerId) -> Option<RollerState> {
        self.with_entry(roller_id, |context| context.state())
    }

    pub fn verdict_of(&self, roller_id: RollerId) -> Option<Arc<Verdict>> {
        self.with_entry(roller_id, |context| context.verdict().cloned())
            .flatten()
    }

    /// Whether `roller_id` was tracked once and has since been removed.
    pub fn is_retired(&self, roller_id: RollerId) -> bool {
        roller_id.0 < self.entered_below.load(Ordering::SeqCst) && self.get(roller_id).is_none()
    }

    /// Rollers not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.ids()
            .into_iter()
            .filter(|id| {
                self.state_of(*id)
                    .map(|state| !state.is_terminal())
                    .unwrap_or(false)
            })
            .count()
    }
}

impl EvictionPolicy for RollerTable {
    /// A queued frame may make room when its roller already has a view from
    /// another camera, or when the roller no longer takes reports at all. A
    /// roller the aggregator has not registered yet is never evicted.
    fn may_evict(&self, frame: &Frame) -> bool {
        let Some(roller_id) = frame.roller_id() else {
            return true;
        };
        self.with_entry(roller_id, |context| {
            !context.state().accepts_reports()
                || context.has_partial_results_besides(frame.camera_id())
        })
        .unwrap_or_else(|| self.is_retired(roller_id))
    }
}

pub(crate) fn lock(handle: &RollerHandle) -> MutexGuard<'_, RollerContext> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
