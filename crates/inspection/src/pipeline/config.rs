//! Line configuration for the inspection pipeline.
//!
//! Everything that shapes timing lives here: line geometry, per-camera
//! offsets, queue sizing, decision thresholds, and supervision periods. The
//! config is loaded once, validated, and then shared read-only with every
//! stage.

use std::{collections::BTreeSet, fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use defect_core::ThresholdProfile;
use line_ingest::{CameraId, MotionSource};
use serde::{Deserialize, Serialize};

use crate::pipeline::{archive::ArchiveConfig, data::Action};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    pub line: LineConfig,
    pub cameras: Vec<CameraConfig>,
    /// Cameras every roller must be seen by. Defaults to all cameras.
    pub expected_cameras: Option<Vec<CameraId>>,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub decision: DecisionConfig,
    pub actuation: ActuationConfig,
    pub supervision: SupervisionConfig,
    pub persistence: PersistenceConfig,
    #[serde(skip)]
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTrigger {
    /// A roller enters every `roller_pitch_mm` of travel.
    Pitch,
    /// Entries are signalled externally, e.g. by a proximity sensor.
    Sensor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    pub motion: MotionSource,
    pub roller_pitch_mm: f64,
    pub entry_trigger: EntryTrigger,
    /// Distance from the inspection zone entry to the reject actuator.
    pub transit_distance_mm: f64,
    /// Transit budget used while the line velocity is unknown or zero.
    pub fallback_transit_ms: u64,
    pub entry_poll_ms: u64,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            motion: MotionSource::FixedSpeed { mm_per_sec: 500.0 },
            roller_pitch_mm: 100.0,
            entry_trigger: EntryTrigger::Pitch,
            transit_distance_mm: 600.0,
            fallback_transit_ms: 1_200,
            entry_poll_ms: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    /// Distance of the camera's field of view past the zone entry.
    #[serde(default)]
    pub offset_mm: f64,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

impl CameraConfig {
    pub fn new(id: CameraId, offset_mm: f64) -> Self {
        Self {
            id,
            offset_mm,
            capture_timeout_ms: default_capture_timeout_ms(),
        }
    }
}

fn default_capture_timeout_ms() -> u64 {
    500
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    /// How long a camera intake may block on a full queue.
    pub push_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            push_timeout_ms: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub inference_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            inference_timeout_ms: 80,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub thresholds: ThresholdProfile,
    /// Share of expected views that must report before ACCEPT is allowed.
    pub min_view_fraction: f64,
    /// Collection deadline measured from roller entry.
    pub collect_deadline_ms: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdProfile::default(),
            min_view_fraction: 1.0,
            collect_deadline_ms: 200,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// PASS verdicts need no command; the roller simply continues.
    Silent,
    /// Send an explicit PASS command to the PLC.
    Explicit,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationConfig {
    /// Time the PLC needs between receiving a command and the roller reaching
    /// the actuator.
    pub command_lead_ms: u64,
    pub pass_mode: PassMode,
    pub inconclusive_action: Action,
    /// Upper bound on one PLC call. Must fit inside the command lead so an
    /// acknowledged command always lands before the roller does.
    pub plc_timeout_ms: u64,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            command_lead_ms: 20,
            pass_mode: PassMode::Silent,
            inconclusive_action: Action::Reject,
            plc_timeout_ms: 15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    pub health_interval_ms: u64,
    pub stale_after_ms: u64,
    pub startup_grace_ms: u64,
    /// How long the PLC link may stay down before intake is paused.
    pub plc_link_grace_ms: u64,
    /// Rollers still undecided after this long are force-expired.
    pub roller_max_lifetime_ms: u64,
    /// Finished rollers are kept this long for late reports and inspection.
    pub terminal_retention_ms: u64,
    /// Upper bound on waiting for in-flight rollers at shutdown.
    pub drain_timeout_ms: u64,
    pub alert_history: usize,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 50,
            stale_after_ms: 1_500,
            startup_grace_ms: 5_000,
            plc_link_grace_ms: 500,
            roller_max_lifetime_ms: 1_000,
            terminal_retention_ms: 2_000,
            drain_timeout_ms: 2_000,
            alert_history: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON-lines record file. `None` keeps records in memory only.
    pub path: Option<PathBuf>,
    /// Annotated view images. `None` keeps no images.
    pub archive: Option<ArchiveConfig>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: None,
            archive: None,
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and runtime inspection.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Default to `debug` logging when `RUST_LOG` is unset.
    pub verbose: bool,
}

pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl InspectionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_camera(mut self, camera: CameraConfig) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn expected_cameras(&self) -> BTreeSet<CameraId> {
        match &self.expected_cameras {
            Some(ids) => ids.iter().copied().collect(),
            None => self.cameras.iter().map(|camera| camera.id).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("at least one camera must be configured");
        }
        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                bail!("camera {} is configured twice", camera.id);
            }
            if camera.offset_mm < 0.0 {
                bail!("camera {} offset must not be negative", camera.id);
            }
        }
        if let Some(expected) = &self.expected_cameras {
            if expected.is_empty() {
                bail!("expected_cameras must not be empty");
            }
            if let Some(unknown) = expected.iter().find(|id| !seen.contains(id)) {
                bail!("expected camera {unknown} is not configured");
            }
        }

        if self.line.roller_pitch_mm <= 0.0 {
            bail!("roller_pitch_mm must be positive");
        }
        if self.line.transit_distance_mm <= 0.0 {
            bail!("transit_distance_mm must be positive");
        }
        if self.line.fallback_transit_ms == 0 {
            bail!("fallback_transit_ms must be at least 1");
        }
        if let MotionSource::FixedSpeed { mm_per_sec } = self.line.motion {
            if mm_per_sec <= 0.0 {
                bail!("fixed line speed must be positive");
            }
        }

        if self.queue.capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if self.workers.count == 0 {
            bail!("at least one inference worker is required");
        }
        if self.workers.inference_timeout_ms == 0 {
            bail!("inference_timeout_ms must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.decision.min_view_fraction) {
            bail!("min_view_fraction must be within 0..=1");
        }
        if self.decision.collect_deadline_ms == 0 {
            bail!("collect_deadline_ms must be at least 1");
        }
        self.decision
            .thresholds
            .validate()
            .context("invalid decision thresholds")?;

        if self.supervision.roller_max_lifetime_ms <= self.decision.collect_deadline_ms {
            bail!("roller_max_lifetime_ms must exceed collect_deadline_ms");
        }
        if self.supervision.health_interval_ms == 0 {
            bail!("health_interval_ms must be at least 1");
        }
        if self.actuation.command_lead_ms == 0 {
            bail!("command_lead_ms must be at least 1");
        }
        if self.actuation.command_lead_ms >= self.line.fallback_transit_ms {
            bail!("command_lead_ms must be shorter than fallback_transit_ms");
        }
        if self.actuation.plc_timeout_ms == 0 {
            bail!("plc_timeout_ms must be at least 1");
        }
        if self.actuation.plc_timeout_ms >= self.actuation.command_lead_ms {
            bail!(
                "plc_timeout_ms ({}) must be shorter than command_lead_ms ({})",
                self.actuation.plc_timeout_ms,
                self.actuation.command_lead_ms
            );
        }
        if self.persistence.max_attempts == 0 {
            bail!("persistence max_attempts must be at least 1");
        }
        Ok(())
    }

    pub(crate) fn collect_deadline(&self) -> Duration {
        ms(self.decision.collect_deadline_ms)
    }

    pub(crate) fn max_lifetime(&self) -> Duration {
        ms(self.supervision.roller_max_lifetime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cameras() -> InspectionConfig {
        InspectionConfig::default()
            .with_camera(CameraConfig::new(CameraId(1), 0.0))
            .with_camera(CameraConfig::new(CameraId(2), 40.0))
    }

    #[test]
    fn defaults_validate_once_cameras_exist() {
        assert!(InspectionConfig::default().validate().is_err());
        let config = two_cameras();
        config.validate().unwrap();
        assert_eq!(
            config.expected_cameras(),
            BTreeSet::from([CameraId(1), CameraId(2)])
        );
    }

    #[test]
    fn rejects_duplicate_and_unknown_cameras() {
        let duplicated = two_cameras().with_camera(CameraConfig::new(CameraId(2), 10.0));
        assert!(duplicated.validate().is_err());

        let mut unknown = two_cameras();
        unknown.expected_cameras = Some(vec![CameraId(9)]);
        assert!(unknown.validate().is_err());
    }

    #[test]
    fn lifetime_must_outlast_collection() {
        let mut config = two_cameras();
        config.supervision.roller_max_lifetime_ms = config.decision.collect_deadline_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn plc_timeout_must_fit_inside_the_command_lead() {
        let mut config = two_cameras();
        config.actuation.plc_timeout_ms = config.actuation.command_lead_ms;
        assert!(config.validate().is_err());
        config.actuation.plc_timeout_ms = 50;
        assert!(config.validate().is_err());
        config.actuation.plc_timeout_ms = config.actuation.command_lead_ms - 1;
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_json() {
        let config: InspectionConfig = serde_json::from_str(
            r#"{
                "line": { "motion": { "mode": "encoder" }, "roller_pitch_mm": 120 },
                "cameras": [{ "id": 1 }, { "id": 2, "offset_mm": 60 }],
                "decision": { "thresholds": { "class_confidence": { "crack": 0.8 } } },
                "actuation": { "pass_mode": "explicit", "inconclusive_action": "pass" }
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.line.motion, MotionSource::Encoder);
        assert_eq!(config.cameras[0].capture_timeout_ms, 500);
        assert_eq!(config.decision.thresholds.confidence_for("crack"), 0.8);
        assert_eq!(config.actuation.pass_mode, PassMode::Explicit);
        assert_eq!(config.actuation.inconclusive_action, Action::Pass);
        assert_eq!(config.queue.capacity, 16);
    }
}
