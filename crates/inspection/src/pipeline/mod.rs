//! Roller inspection pipeline from camera frame to reject actuator.
//!
//! The module is split into focused submodules:
//! - `config`: JSON line configuration and validation.
//! - `coordinator`: Starts, pauses, and stops every stage.
//! - `intake`: Camera intake threads, roller assignment, and the pause gate.
//! - `dispatch`: Bounded frame queue with backpressure and eviction.
//! - `workers`: Inference worker threads.
//! - `roller`: Per-roller state machine and the roller table.
//! - `aggregator`: Decision rule and the aggregation thread.
//! - `actuation`: Transit budget and timed PLC commands.
//! - `supervisor`: Liveness, PLC link grace, expiry, and alerts.
//! - `persistence`: Verdict and outcome stores plus the writer thread.
//! - `archive`: Annotated view images written off the inference path.
//! - `plc`: PLC link contract.
//! - `watchdog`: Heartbeats and the health report.
//! - `stats`: Running counters.
//! - `telemetry`: Tracing and Prometheus setup.
//! - `data`: Messages shared between stages.

/// Re-export the operator-facing surface so callers never reach into
/// submodules.
pub use actuation::{ActuationPlan, ActuationPolicy, TransitTiming, plan_actuation};
pub use aggregator::DecisionRule;
pub use archive::{ArchiveConfig, ArchiveError, ArchivedView, annotate};
pub use config::{
    ActuationConfig, CameraConfig, DecisionConfig, EntryTrigger, InspectionConfig, LineConfig,
    PassMode, PersistenceConfig, QueueConfig, SupervisionConfig, TelemetryOptions, WorkerConfig,
};
pub use coordinator::{InspectionCoordinator, LineAdapters};
pub use data::{
    Action, ActuationCommand, Alert, AlertKind, DecidedRoller, Decision, DropReason,
    OutcomeRecord, PipelineEvent, RollerOutcome, TimingViolation, Verdict, ViewFailure,
    ViewOutcome, ViewReport,
};
pub use dispatch::{DispatchQueue, EvictionPolicy, NoEviction, Popped, PushOutcome};
pub use persistence::{
    InspectionStore, JsonLinesStore, MemoryStore, PersistenceError, PersistenceHandle,
    RetryPolicy, StoredRecord, spawn_persistence_sink,
};
pub use plc::{LinkError, LinkStatus, PlcAck, PlcLink};
pub use roller::{RollerContext, RollerError, RollerState, RollerTable};
pub use stats::{InspectionStats, StatsSnapshot};
pub use watchdog::{CameraHealth, ComponentStatus, HealthReport, IntakeState, PauseReason};
pub use workers::DetectorFactory;

mod actuation;
mod aggregator;
mod archive;
mod config;
mod coordinator;
mod data;
mod dispatch;
mod intake;
mod persistence;
mod plc;
mod roller;
mod stats;
mod supervisor;
pub mod telemetry;
mod watchdog;
mod workers;
