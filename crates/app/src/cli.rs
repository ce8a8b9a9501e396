//! Command-line surface of `roller-inspect`.
//!
//! Flags only override a handful of fields; everything else comes from the
//! JSON line configuration (or its defaults). Arguments are translated into
//! run plans through `TryFrom`, which is also where they are validated.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use defect_core::LocatorGate;
use inspection::{ArchiveConfig, CameraConfig, EntryTrigger, InspectionConfig, TelemetryOptions};
use line_ingest::{CameraId, MotionSource};

#[derive(Debug, Parser)]
#[command(name = "roller-inspect", version, about = "Roller inspection line runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the line against simulated cameras, detector, and PLC.
    Simulate(SimulateArgs),
    /// Feed directories of still images through the pipeline.
    Replay(ReplayArgs),
}

/// Flags shared by every run mode.
#[derive(Debug, Args)]
pub struct LineArgs {
    /// JSON line configuration. Defaults apply to missing fields.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Number of inference workers.
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,
    /// Dispatch queue capacity in frames.
    #[arg(long = "queue-capacity", value_name = "N")]
    pub queue_capacity: Option<usize>,
    /// Append verdicts and outcomes to this JSON Lines file.
    #[arg(long = "records", value_name = "PATH")]
    pub records: Option<PathBuf>,
    /// Save annotated images of views with a defect under this directory.
    #[arg(long = "archive", value_name = "DIR")]
    pub archive: Option<PathBuf>,
    /// With --archive, keep every inferred view, not only defect views.
    #[arg(long = "archive-all", action = clap::ArgAction::SetTrue, requires = "archive")]
    pub archive_all: bool,
    /// Bind address of the HTTP control surface.
    #[arg(long = "http", value_name = "ADDR", default_value = "127.0.0.1:9090")]
    pub http: SocketAddr,
    /// Do not start the HTTP control surface.
    #[arg(long = "no-http", action = clap::ArgAction::SetTrue)]
    pub no_http: bool,
    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long = "duration", value_name = "SECS")]
    pub duration: Option<f64>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub line: LineArgs,
    /// Cameras to simulate when no config file is given.
    #[arg(long = "cameras", value_name = "N", default_value_t = 2)]
    pub cameras: u16,
    /// Inject a confident crack into every N-th roller. 0 disables injection.
    #[arg(long = "defect-every", value_name = "N", default_value_t = 7)]
    pub defect_every: u64,
    /// Simulated inference time per view.
    #[arg(long = "inference-ms", value_name = "MS", default_value_t = 15)]
    pub inference_ms: u64,
    /// Take the simulated PLC link down after this many seconds.
    #[arg(long = "plc-outage-after", value_name = "SECS")]
    pub plc_outage_after: Option<f64>,
    /// How long the simulated PLC outage lasts.
    #[arg(long = "plc-outage-for", value_name = "SECS", default_value_t = 1.0)]
    pub plc_outage_for: f64,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub line: LineArgs,
    /// Image directory for one camera, as CAMERA_ID=DIR. Repeat per camera.
    #[arg(long = "images", value_name = "CAMERA_ID=DIR", value_parser = parse_image_source, required = true)]
    pub images: Vec<(u16, PathBuf)>,
    /// Delay between replayed frames.
    #[arg(long = "frame-interval-ms", value_name = "MS", default_value_t = 100)]
    pub frame_interval_ms: u64,
    /// Start over at the first image once a directory is exhausted.
    #[arg(long = "loop", action = clap::ArgAction::SetTrue)]
    pub looped: bool,
    /// TorchScript defect model.
    #[cfg(feature = "with-tch")]
    #[arg(long = "model", value_name = "PATH")]
    pub model: PathBuf,
    /// Class names in model output order, comma separated.
    #[cfg(feature = "with-tch")]
    #[arg(long = "classes", value_name = "LIST", value_delimiter = ',', default_value = "roller,crack,dent,rust")]
    pub classes: Vec<String>,
    /// Model input size as WIDTHxHEIGHT. Replayed images must match it.
    #[cfg(feature = "with-tch")]
    #[arg(long = "input-size", value_name = "WxH", value_parser = parse_size, default_value = "640x640")]
    pub input_size: (i64, i64),
    /// Force CPU inference.
    #[cfg(feature = "with-tch")]
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
}

fn parse_image_source(raw: &str) -> Result<(u16, PathBuf), String> {
    let (id, dir) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected CAMERA_ID=DIR, got '{raw}'"))?;
    let id = id
        .trim()
        .parse::<u16>()
        .map_err(|err| format!("invalid camera id '{id}': {err}"))?;
    if dir.trim().is_empty() {
        return Err(format!("camera {id} has an empty image directory"));
    }
    Ok((id, PathBuf::from(dir.trim())))
}

#[cfg(feature = "with-tch")]
fn parse_size(raw: &str) -> Result<(i64, i64), String> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{raw}'"))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("invalid dimension '{value}'"))
    };
    Ok((parse(w)?, parse(h)?))
}

/// Settings every run mode needs besides its adapters.
#[derive(Debug)]
pub struct RunSettings {
    pub config: InspectionConfig,
    pub http: Option<SocketAddr>,
    pub duration: Option<Duration>,
}

impl LineArgs {
    /// Resolve the line configuration. `default_cameras` is used only when no
    /// config file is given.
    fn settings(self, default_cameras: impl FnOnce() -> Vec<CameraConfig>) -> Result<RunSettings> {
        let mut config = match &self.config {
            Some(path) => InspectionConfig::from_json_file(path)?,
            None => {
                let mut config = InspectionConfig::default();
                config.cameras = default_cameras();
                config
            }
        };
        if let Some(workers) = self.workers {
            if workers == 0 {
                bail!("--workers must be at least 1");
            }
            config.workers.count = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            if capacity == 0 {
                bail!("--queue-capacity must be at least 1");
            }
            config.queue.capacity = capacity;
        }
        if let Some(records) = self.records {
            config.persistence.path = Some(records);
        }
        if let Some(dir) = self.archive {
            config.persistence.archive = Some(ArchiveConfig {
                dir,
                all_views: self.archive_all,
            });
        }
        config.telemetry = TelemetryOptions {
            chrome_trace_path: self.chrome_trace,
            verbose: self.verbose,
        };
        config.validate().context("invalid line configuration")?;

        Ok(RunSettings {
            config,
            http: (!self.no_http).then_some(self.http),
            duration: self.duration.map(seconds).transpose()?,
        })
    }
}

fn seconds(value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        bail!("durations must be positive, got {value}");
    }
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => Ok(duration),
        Err(err) => bail!("duration of {value} s is out of range: {err}"),
    }
}

/// Everything `roller-inspect simulate` needs.
#[derive(Debug)]
pub struct SimulationPlan {
    pub settings: RunSettings,
    pub belt_mm_per_sec: f64,
    pub defect_every: u64,
    pub inference_delay: Duration,
    /// When the PLC link drops, and for how long.
    pub plc_outage: Option<(Duration, Duration)>,
}

/// Camera offsets for a simulated line: evenly spaced 20 mm apart.
fn simulated_cameras(count: u16) -> Vec<CameraConfig> {
    (1..=count)
        .map(|id| CameraConfig::new(CameraId(id), f64::from(id - 1) * 20.0))
        .collect()
}

impl TryFrom<SimulateArgs> for SimulationPlan {
    type Error = anyhow::Error;

    fn try_from(args: SimulateArgs) -> Result<Self> {
        if args.cameras == 0 {
            bail!("--cameras must be at least 1");
        }
        let cameras = args.cameras;
        let mut settings = args.line.settings(|| simulated_cameras(cameras))?;
        let config = &mut settings.config;

        let MotionSource::FixedSpeed { mm_per_sec } = config.line.motion else {
            bail!("simulation needs a fixed-speed line");
        };
        if config.line.entry_trigger != EntryTrigger::Pitch {
            bail!("simulation derives roller entries from the pitch; set entry_trigger to pitch");
        }
        // The simulated detector locates the roller on every view.
        let thresholds = &mut config.decision.thresholds;
        if thresholds.locator.is_none() {
            thresholds.locator = Some(LocatorGate::default());
        }

        let plc_outage = match args.plc_outage_after {
            Some(after) => Some((seconds(after)?, seconds(args.plc_outage_for)?)),
            None => None,
        };
        Ok(Self {
            settings,
            belt_mm_per_sec: mm_per_sec,
            defect_every: args.defect_every,
            inference_delay: Duration::from_millis(args.inference_ms),
            plc_outage,
        })
    }
}

/// Everything `roller-inspect replay` needs.
#[derive(Debug)]
pub struct ReplayPlan {
    pub settings: RunSettings,
    pub sources: Vec<(CameraId, PathBuf)>,
    pub frame_interval: Duration,
    pub looped: bool,
    #[cfg(feature = "with-tch")]
    pub model: ModelOptions,
}

#[cfg(feature = "with-tch")]
#[derive(Debug)]
pub struct ModelOptions {
    pub path: PathBuf,
    pub classes: Vec<String>,
    pub input_size: (i64, i64),
    pub use_cpu: bool,
}

impl TryFrom<ReplayArgs> for ReplayPlan {
    type Error = anyhow::Error;

    fn try_from(args: ReplayArgs) -> Result<Self> {
        let mut sources: Vec<(CameraId, PathBuf)> = args
            .images
            .into_iter()
            .map(|(id, dir)| (CameraId(id), dir))
            .collect();
        sources.sort_by_key(|(id, _)| *id);
        if sources.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            bail!("each camera may have only one --images directory");
        }
        for (id, dir) in &sources {
            if !dir.is_dir() {
                bail!("image directory for camera {id} does not exist: {}", dir.display());
            }
        }
        if args.frame_interval_ms == 0 {
            bail!("--frame-interval-ms must be at least 1");
        }

        let camera_ids: Vec<CameraId> = sources.iter().map(|(id, _)| *id).collect();
        let settings = args.line.settings(|| {
            camera_ids
                .iter()
                .map(|id| CameraConfig::new(*id, 0.0))
                .collect()
        })?;
        let mut configured: Vec<CameraId> =
            settings.config.cameras.iter().map(|camera| camera.id).collect();
        configured.sort();
        if configured != camera_ids {
            bail!("--images cameras {camera_ids:?} do not match configured cameras {configured:?}");
        }

        #[cfg(feature = "with-tch")]
        let model = {
            if !args.model.is_file() {
                bail!("model file does not exist: {}", args.model.display());
            }
            if args.classes.is_empty() {
                bail!("--classes must name at least one class");
            }
            ModelOptions {
                path: args.model,
                classes: args.classes,
                input_size: args.input_size,
                use_cpu: args.use_cpu,
            }
        };

        Ok(Self {
            settings,
            sources,
            frame_interval: Duration::from_millis(args.frame_interval_ms),
            looped: args.looped,
            #[cfg(feature = "with-tch")]
            model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["roller-inspect"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    fn simulate(args: &[&str]) -> Result<SimulationPlan> {
        let mut argv = vec!["simulate"];
        argv.extend_from_slice(args);
        match parse(&argv) {
            Command::Simulate(args) => SimulationPlan::try_from(args),
            other => panic!("expected simulate, got {other:?}"),
        }
    }

    #[test]
    fn simulate_defaults_build_a_valid_line() {
        let plan = simulate(&["--no-http"]).unwrap();
        assert_eq!(plan.settings.config.cameras.len(), 2);
        assert_eq!(plan.settings.http, None);
        assert_eq!(plan.settings.duration, None);
        assert_eq!(plan.defect_every, 7);
        assert!(plan.plc_outage.is_none());
        assert_eq!(
            plan.settings.config.decision.thresholds.locator,
            Some(LocatorGate::default())
        );
    }

    #[test]
    fn overrides_apply_and_are_validated() {
        let plan = simulate(&[
            "--workers",
            "4",
            "--queue-capacity",
            "32",
            "--cameras",
            "3",
            "--duration",
            "2.5",
            "--plc-outage-after",
            "1",
        ])
        .unwrap();
        assert_eq!(plan.settings.config.workers.count, 4);
        assert_eq!(plan.settings.config.queue.capacity, 32);
        assert_eq!(plan.settings.config.cameras.len(), 3);
        assert_eq!(plan.settings.duration, Some(Duration::from_millis(2_500)));
        assert_eq!(
            plan.plc_outage,
            Some((Duration::from_secs(1), Duration::from_secs(1)))
        );

        assert!(simulate(&["--workers", "0"]).is_err());
        assert!(simulate(&["--cameras", "0"]).is_err());
        assert!(simulate(&["--duration=-1"]).is_err());
        assert!(simulate(&["--duration", "1e20"]).is_err());
        assert!(simulate(&["--plc-outage-after", "1e300"]).is_err());
    }

    #[test]
    fn archive_flags_configure_the_frame_archive() {
        let plan = simulate(&["--archive", "/tmp/views", "--archive-all"]).unwrap();
        assert_eq!(
            plan.settings.config.persistence.archive,
            Some(ArchiveConfig {
                dir: PathBuf::from("/tmp/views"),
                all_views: true,
            })
        );
        assert!(simulate(&[]).unwrap().settings.config.persistence.archive.is_none());
        assert!(Cli::try_parse_from(["roller-inspect", "simulate", "--archive-all"]).is_err());
    }

    #[test]
    fn image_sources_parse() {
        assert_eq!(
            parse_image_source("2=/data/cam2"),
            Ok((2, PathBuf::from("/data/cam2")))
        );
        assert!(parse_image_source("cam2").is_err());
        assert!(parse_image_source("x=/data").is_err());
        assert!(parse_image_source("3=").is_err());
    }

    fn replay(source: &str) -> Result<ReplayPlan> {
        let mut argv = vec!["replay", "--images", source, "--no-http"];
        #[cfg(feature = "with-tch")]
        argv.extend_from_slice(&["--model", "missing.pt"]);
        match parse(&argv) {
            Command::Replay(args) => ReplayPlan::try_from(args),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn replay_requires_existing_directories() {
        assert!(replay("1=/definitely/not/here").is_err());

        let dir = tempfile::tempdir().unwrap();
        let result = replay(&format!("1={}", dir.path().display()));
        #[cfg(not(feature = "with-tch"))]
        {
            let plan = result.unwrap();
            assert_eq!(plan.sources, vec![(CameraId(1), dir.path().to_path_buf())]);
            assert_eq!(plan.settings.config.cameras.len(), 1);
        }
        #[cfg(feature = "with-tch")]
        assert!(result.is_err());
    }
}
