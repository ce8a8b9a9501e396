//! Messages and records passed between pipeline stages.

use std::{sync::Arc, time::Duration, time::Instant};

use chrono::{DateTime, Utc};
use defect_core::Detection;
use line_ingest::{CameraId, RollerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a camera view produced no detections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewFailure {
    InferenceTimeout,
    InferenceFailed,
    CaptureFailed,
    /// The dispatch queue stayed full past the push timeout.
    QueueTimeout,
    /// Evicted from a full queue in favour of a newer frame.
    Evicted,
}

impl ViewFailure {
    /// Failures caused by backpressure rather than a faulty component.
    pub fn is_backpressure(self) -> bool {
        matches!(self, ViewFailure::QueueTimeout | ViewFailure::Evicted)
    }

    pub fn label(self) -> &'static str {
        match self {
            ViewFailure::InferenceTimeout => "inference_timeout",
            ViewFailure::InferenceFailed => "inference_failed",
            ViewFailure::CaptureFailed => "capture_failed",
            ViewFailure::QueueTimeout => "queue_timeout",
            ViewFailure::Evicted => "evicted",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ViewOutcome {
    /// Detections above the model floor; may be empty.
    Detections(Vec<Detection>),
    Failed(ViewFailure),
}

/// Result of one camera view of one roller.
#[derive(Clone, Debug)]
pub struct ViewReport {
    pub roller_id: RollerId,
    pub camera_id: CameraId,
    pub captured_at: Instant,
    pub outcome: ViewOutcome,
}

impl ViewReport {
    pub fn detections(
        roller_id: RollerId,
        camera_id: CameraId,
        captured_at: Instant,
        detections: Vec<Detection>,
    ) -> Self {
        Self {
            roller_id,
            camera_id,
            captured_at,
            outcome: ViewOutcome::Detections(detections),
        }
    }

    pub fn failed(
        roller_id: RollerId,
        camera_id: CameraId,
        captured_at: Instant,
        failure: ViewFailure,
    ) -> Self {
        Self {
            roller_id,
            camera_id,
            captured_at,
            outcome: ViewOutcome::Failed(failure),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Accept,
    Reject,
    Inconclusive,
}

impl Decision {
    pub fn label(self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Reject => "reject",
            Decision::Inconclusive => "inconclusive",
        }
    }
}

/// Final, immutable verdict for one roller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub roller_id: RollerId,
    pub decision: Decision,
    /// Every detection reported for the roller, defect or not.
    pub contributing_detections: Vec<Detection>,
    /// Classes that crossed their reject threshold.
    pub defect_classes: Vec<String>,
    pub reported_cameras: Vec<CameraId>,
    pub missing_cameras: Vec<CameraId>,
    /// A view was lost to backpressure.
    pub degraded: bool,
    /// Decided by the lifetime sweep rather than the aggregator.
    pub forced: bool,
    pub decided_at: DateTime<Utc>,
    /// Time from roller entry to the decision.
    pub decision_latency: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Reject,
    Pass,
}

/// Command handed to the PLC. The roller must reach the actuator at
/// `fire_at`, which is also `fire_at_position_mm` along the line.
#[derive(Clone, Debug, PartialEq)]
pub struct ActuationCommand {
    pub roller_id: RollerId,
    pub action: Action,
    pub fire_at: Instant,
    pub fire_at_position_mm: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    TimingViolation,
    LinkError,
    /// Exceeded the maximum roller lifetime without a decision.
    Expired,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollerOutcome {
    /// `command_sent` is false for silent PASS verdicts.
    Actuated { action: Action, command_sent: bool },
    Dropped { reason: DropReason },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub roller_id: RollerId,
    pub outcome: RollerOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn now(roller_id: RollerId, outcome: RollerOutcome) -> Self {
        Self {
            roller_id,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("roller {roller_id} decided after {latency:?}, transit budget is {budget:?}")]
pub struct TimingViolation {
    pub roller_id: RollerId,
    pub latency: Duration,
    pub budget: Duration,
}

/// Verdict plus the timing the scheduler needs to plan actuation.
#[derive(Clone, Debug)]
pub struct DecidedRoller {
    pub verdict: Arc<Verdict>,
    pub created_at: Instant,
    pub decided_at: Instant,
    pub entry_position_mm: f64,
}

/// Out-of-band notifications consumed by the supervisor.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    TimingViolation(TimingViolation),
    LinkError {
        roller_id: Option<RollerId>,
        error: String,
    },
    RollerExpired {
        roller_id: RollerId,
        age: Duration,
    },
    FrameDropped {
        roller_id: RollerId,
        camera_id: CameraId,
        failure: ViewFailure,
    },
    CaptureFailed {
        camera_id: CameraId,
        error: String,
    },
    CameraStopped {
        camera_id: CameraId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TimingViolation,
    LinkError,
    LinkLoss,
    RollerExpired,
    CaptureFailure,
    ComponentStale,
}

/// Operator-facing alert kept in the coordinator's recent history.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Everything the aggregator consumes, in arrival order.
#[derive(Debug)]
pub(crate) enum AggregatorInput {
    Entered {
        roller_id: RollerId,
        entered_at: Instant,
        entry_position_mm: f64,
    },
    Report(ViewReport),
    Outcome {
        roller_id: RollerId,
        outcome: RollerOutcome,
    },
    /// Decide everything still collecting, then drain.
    Shutdown,
}
