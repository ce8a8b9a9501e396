//! Conveyor position tracking.
//!
//! The tracker turns either a fixed line speed or periodic encoder readings
//! into a monotonic position estimate in millimetres. Rollers are spaced one
//! pitch apart; each time the estimate crosses the next pitch boundary a new
//! roller is considered to have entered the inspection zone. Lines with a
//! proximity sensor call [`LinePositionTracker::trigger_entry`] instead.

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::RollerId;

const ENTRY_HISTORY: usize = 64;
const VELOCITY_SMOOTHING: f64 = 0.8;
/// Smoothed speeds below this are treated as a stopped line.
pub const MIN_VELOCITY_MM_PER_SEC: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MotionSource {
    /// Constant belt speed.
    FixedSpeed { mm_per_sec: f64 },
    /// Position driven by [`LinePositionTracker::record_encoder`].
    Encoder,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RollerEntry {
    pub roller_id: RollerId,
    pub entered_at: Instant,
    pub entry_position_mm: f64,
}

struct MotionState {
    anchor_at: Instant,
    anchor_mm: f64,
    velocity_mm_per_sec: f64,
    next_entry_mm: f64,
    next_roller: u64,
    recent: VecDeque<RollerEntry>,
}

impl MotionState {
    fn project(&self, at: Instant) -> f64 {
        match at.checked_duration_since(self.anchor_at) {
            Some(elapsed) => self.anchor_mm + self.velocity_mm_per_sec * elapsed.as_secs_f64(),
            None => self.anchor_mm,
        }
    }

    fn push_entry(&mut self, entered_at: Instant, entry_position_mm: f64) -> RollerEntry {
        let entry = RollerEntry {
            roller_id: RollerId(self.next_roller),
            entered_at,
            entry_position_mm,
        };
        self.next_roller = self.next_roller.wrapping_add(1);
        if self.recent.len() == ENTRY_HISTORY {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
        entry
    }
}

/// Cloneable handle onto one line's motion estimate.
#[derive(Clone)]
pub struct LinePositionTracker {
    state: Arc<RwLock<MotionState>>,
    source: MotionSource,
    roller_pitch_mm: f64,
    pitch_entries: bool,
}

impl LinePositionTracker {
    /// Start tracking at position zero. The first roller enters at `started_at`.
    pub fn new(source: MotionSource, roller_pitch_mm: f64, started_at: Instant) -> Self {
        let velocity_mm_per_sec = match source {
            MotionSource::FixedSpeed { mm_per_sec } => mm_per_sec.max(0.0),
            MotionSource::Encoder => 0.0,
        };
        Self {
            state: Arc::new(RwLock::new(MotionState {
                anchor_at: started_at,
                anchor_mm: 0.0,
                velocity_mm_per_sec,
                next_entry_mm: 0.0,
                next_roller: 1,
                recent: VecDeque::with_capacity(ENTRY_HISTORY),
            })),
            source,
            roller_pitch_mm,
            pitch_entries: true,
        }
    }

    /// Disable pitch-derived entries; rollers only enter via `trigger_entry`.
    pub fn with_sensor_entries(mut self) -> Self {
        self.pitch_entries = false;
        self
    }

    pub fn source(&self) -> MotionSource {
        self.source
    }

    pub fn roller_pitch_mm(&self) -> f64 {
        self.roller_pitch_mm
    }

    pub fn position_at(&self, at: Instant) -> f64 {
        self.read().project(at)
    }

    pub fn velocity_mm_per_sec(&self) -> f64 {
        self.read().velocity_mm_per_sec
    }

    /// Feed an absolute encoder reading. Readings that would move the line
    /// backwards are ignored and `false` is returned.
    pub fn record_encoder(&self, position_mm: f64, at: Instant) -> bool {
        let mut state = self.write();
        let Some(elapsed) = at.checked_duration_since(state.anchor_at) else {
            return false;
        };
        if position_mm < state.anchor_mm {
            warn!(
                reading = position_mm,
                anchor = state.anchor_mm,
                "ignoring encoder reading behind tracked position"
            );
            return false;
        }
        let dt = elapsed.as_secs_f64();
        if position_mm == state.anchor_mm {
            state.velocity_mm_per_sec = 0.0;
        } else if dt > 0.0 {
            let instant = (position_mm - state.anchor_mm) / dt;
            let smoothed = if state.velocity_mm_per_sec == 0.0 {
                instant
            } else {
                VELOCITY_SMOOTHING * state.velocity_mm_per_sec
                    + (1.0 - VELOCITY_SMOOTHING) * instant
            };
            state.velocity_mm_per_sec = if smoothed < MIN_VELOCITY_MM_PER_SEC {
                0.0
            } else {
                smoothed
            };
        }
        state.anchor_at = at;
        state.anchor_mm = position_mm;
        true
    }

    /// Report every roller whose entry boundary has been crossed by `now`.
    pub fn poll_entries(&self, now: Instant) -> Vec<RollerEntry> {
        let mut entries = Vec::new();
        if !self.pitch_entries || self.roller_pitch_mm <= 0.0 {
            return entries;
        }
        let mut state = self.write();
        let position = state.project(now);
        while state.next_entry_mm <= position {
            let boundary = state.next_entry_mm;
            let entered_at = if state.velocity_mm_per_sec >= MIN_VELOCITY_MM_PER_SEC {
                let behind = (position - boundary) / state.velocity_mm_per_sec;
                Duration::try_from_secs_f64(behind)
                    .ok()
                    .and_then(|behind| now.checked_sub(behind))
                    .unwrap_or(now)
            } else {
                now
            };
            entries.push(state.push_entry(entered_at, boundary));
            state.next_entry_mm = boundary + self.roller_pitch_mm;
        }
        entries
    }

    /// Register a sensor-detected roller entry at `at`.
    pub fn trigger_entry(&self, at: Instant) -> RollerEntry {
        let mut state = self.write();
        let position = state.project(at);
        let entry = state.push_entry(at, position);
        state.next_entry_mm = position + self.roller_pitch_mm;
        entry
    }

    /// Roller whose pitch window contains `position_mm`, if still remembered.
    pub fn roller_at(&self, position_mm: f64) -> Option<RollerId> {
        let state = self.read();
        state
            .recent
            .iter()
            .rev()
            .find(|entry| {
                position_mm >= entry.entry_position_mm
                    && position_mm < entry.entry_position_mm + self.roller_pitch_mm
            })
            .map(|entry| entry.roller_id)
    }

    pub fn entry(&self, roller_id: RollerId) -> Option<RollerEntry> {
        self.read()
            .recent
            .iter()
            .find(|entry| entry.roller_id == roller_id)
            .copied()
    }

    fn read(&self) -> RwLockReadGuard<'_, MotionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MotionState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
