//! Heartbeat tracking for cameras, inference workers, and the PLC link.
//!
//! Stages stamp their heartbeat on every iteration; the supervisor compares
//! the stamps against the stale threshold to build the health report. A
//! startup grace period keeps slow-starting components from reporting stale
//! before their first beat.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use line_ingest::CameraId;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::pipeline::{plc::LinkStatus, stats::StatsSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentStatus {
    Up,
    /// Alive but no heartbeat within the stale threshold.
    Stale,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntakeState {
    Stopped,
    Running,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Operator,
    LinkLoss,
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraHealth {
    pub camera_id: CameraId,
    pub status: ComponentStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub camera_status: Vec<CameraHealth>,
    pub inference_status: ComponentStatus,
    pub plc_status: LinkStatus,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub intake: IntakeState,
    pub pause_reasons: Vec<PauseReason>,
    pub active_rollers: usize,
    pub stats: StatsSnapshot,
}

struct CameraBeat {
    last: AtomicU64,
    stopped: AtomicBool,
}

pub(crate) struct PipelineHealth {
    cameras: BTreeMap<CameraId, CameraBeat>,
    inference: AtomicU64,
    workers_alive: AtomicUsize,
    plc_up: AtomicBool,
    plc_down_since: AtomicU64,
    stale_after_ms: u64,
}

impl PipelineHealth {
    pub(crate) fn new(
        cameras: impl IntoIterator<Item = CameraId>,
        stale_after: Duration,
        startup_grace: Duration,
    ) -> Self {
        let grace_deadline = current_millis().saturating_add(startup_grace.as_millis() as u64);
        Self {
            cameras: cameras
                .into_iter()
                .map(|id| {
                    (
                        id,
                        CameraBeat {
                            last: AtomicU64::new(grace_deadline),
                            stopped: AtomicBool::new(false),
                        },
                    )
                })
                .collect(),
            inference: AtomicU64::new(grace_deadline),
            workers_alive: AtomicUsize::new(0),
            plc_up: AtomicBool::new(true),
            plc_down_since: AtomicU64::new(0),
            stale_after_ms: stale_after.as_millis() as u64,
        }
    }

    pub(crate) fn beat_camera(&self, camera_id: CameraId) {
        if let Some(beat) = self.cameras.get(&camera_id) {
            beat.last.store(current_millis(), Ordering::Relaxed);
        }
    }

    pub(crate) fn camera_stopped(&self, camera_id: CameraId) {
        if let Some(beat) = self.cameras.get(&camera_id) {
            beat.stopped.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn beat_inference(&self) {
        self.inference.store(current_millis(), Ordering::Relaxed);
    }

    /// Count a live worker until the returned guard drops.
    pub(crate) fn worker_started(&self) -> WorkerAlive<'_> {
        self.workers_alive.fetch_add(1, Ordering::SeqCst);
        WorkerAlive { health: self }
    }

    /// Record a link poll. Returns how long the link has been down.
    pub(crate) fn record_link(&self, status: LinkStatus) -> Option<Duration> {
        match status {
            LinkStatus::Up => {
                self.plc_up.store(true, Ordering::SeqCst);
                self.plc_down_since.store(0, Ordering::SeqCst);
                None
            }
            LinkStatus::Down => Some(self.mark_link_down()),
        }
    }

    /// A command failed on the link; treat it as down until the next good poll.
    pub(crate) fn link_failed(&self) {
        self.mark_link_down();
    }

    fn mark_link_down(&self) -> Duration {
        let now = current_millis();
        self.plc_up.store(false, Ordering::SeqCst);
        let since = match self.plc_down_since.compare_exchange(
            0,
            now,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => now,
            Err(existing) => existing,
        };
        Duration::from_millis(now.saturating_sub(since))
    }

    pub(crate) fn plc_status(&self) -> LinkStatus {
        if self.plc_up.load(Ordering::SeqCst) {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        }
    }

    pub(crate) fn camera_statuses(&self) -> Vec<CameraHealth> {
        let now = current_millis();
        self.cameras
            .iter()
            .map(|(camera_id, beat)| CameraHealth {
                camera_id: *camera_id,
                status: if beat.stopped.load(Ordering::SeqCst) {
                    ComponentStatus::Down
                } else {
                    self.freshness(now, &beat.last)
                },
            })
            .collect()
    }

    pub(crate) fn inference_status(&self) -> ComponentStatus {
        if self.workers_alive.load(Ordering::SeqCst) == 0 {
            return ComponentStatus::Down;
        }
        self.freshness(current_millis(), &self.inference)
    }

    fn freshness(&self, now: u64, last: &AtomicU64) -> ComponentStatus {
        if now.saturating_sub(last.load(Ordering::Relaxed)) > self.stale_after_ms {
            ComponentStatus::Stale
        } else {
            ComponentStatus::Up
        }
    }
}

pub(crate) struct WorkerAlive<'a> {
    health: &'a PipelineHealth,
}

impl Drop for WorkerAlive<'_> {
    fn drop(&mut self) {
        self.health.workers_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Remembers the last status of each component so the supervisor only logs
/// transitions.
#[derive(Default)]
pub(crate) struct HealthMonitor {
    last: BTreeMap<String, ComponentStatus>,
}

impl HealthMonitor {
    /// Returns `true` when `component` just got worse.
    pub(crate) fn observe(&mut self, component: String, status: ComponentStatus) -> bool {
        let previous = self.last.insert(component.clone(), status);
        let gauge = match status {
            ComponentStatus::Up => 1.0,
            ComponentStatus::Stale => 0.5,
            ComponentStatus::Down => 0.0,
        };
        metrics::gauge!("inspection_component_up", "component" => component.clone()).set(gauge);
        if previous == Some(status) {
            return false;
        }
        match status {
            ComponentStatus::Up => {
                if previous.is_some() {
                    info!("{component} recovered");
                }
                false
            }
            ComponentStatus::Stale => {
                warn!("{component} stopped producing heartbeats");
                true
            }
            ComponentStatus::Down => {
                error!("{component} is down");
                true
            }
        }
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
