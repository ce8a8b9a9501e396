//! Asynchronous verdict and outcome persistence.
//!
//! Stages hand records to a [`PersistenceHandle`] and move on; a dedicated
//! writer thread owns the [`InspectionStore`] and retries failed writes with
//! exponential backoff. The queue is unbounded so a slow store never stalls
//! the decision path.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::pipeline::{
    data::{OutcomeRecord, Verdict},
    stats::InspectionStats,
    telemetry,
};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait InspectionStore: Send {
    fn write_verdict(&mut self, verdict: &Verdict) -> Result<(), PersistenceError>;

    fn write_outcome(&mut self, outcome: &OutcomeRecord) -> Result<(), PersistenceError>;
}

/// One line of the JSON-lines store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Verdict(Verdict),
    Outcome(OutcomeRecord),
}

/// Append-only JSON-lines file.
pub struct JsonLinesStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &StoredRecord) -> Result<(), PersistenceError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read every record back in write order.
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<StoredRecord>, PersistenceError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl InspectionStore for JsonLinesStore {
    fn write_verdict(&mut self, verdict: &Verdict) -> Result<(), PersistenceError> {
        self.append(&StoredRecord::Verdict(verdict.clone()))
    }

    fn write_outcome(&mut self, outcome: &OutcomeRecord) -> Result<(), PersistenceError> {
        self.append(&StoredRecord::Outcome(outcome.clone()))
    }
}

/// In-memory store. Clones share the same record list, so a test can keep
/// one clone and hand the other to the pipeline.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<StoredRecord>>>,
    failures_pending: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn verdicts(&self) -> Vec<Verdict> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                StoredRecord::Verdict(verdict) => Some(verdict),
                StoredRecord::Outcome(_) => None,
            })
            .collect()
    }

    pub fn outcomes(&self) -> Vec<OutcomeRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                StoredRecord::Outcome(outcome) => Some(outcome),
                StoredRecord::Verdict(_) => None,
            })
            .collect()
    }

    fn push(&self, record: StoredRecord) -> Result<(), PersistenceError> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(PersistenceError::Unavailable("injected failure".into()));
        }
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}

impl InspectionStore for MemoryStore {
    fn write_verdict(&mut self, verdict: &Verdict) -> Result<(), PersistenceError> {
        self.push(StoredRecord::Verdict(verdict.clone()))
    }

    fn write_outcome(&mut self, outcome: &OutcomeRecord) -> Result<(), PersistenceError> {
        self.push(StoredRecord::Outcome(outcome.clone()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

enum SinkRecord {
    Verdict(Arc<Verdict>),
    Outcome(OutcomeRecord),
}

/// Cloneable, non-blocking entry point to the writer thread.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Sender<SinkRecord>,
}

impl PersistenceHandle {
    pub fn verdict(&self, verdict: Arc<Verdict>) {
        if self.tx.send(SinkRecord::Verdict(verdict)).is_err() {
            warn!("persistence sink closed; verdict not recorded");
        }
    }

    pub fn outcome(&self, outcome: OutcomeRecord) {
        if self.tx.send(SinkRecord::Outcome(outcome)).is_err() {
            warn!("persistence sink closed; outcome not recorded");
        }
    }
}

/// Spawn the writer thread. It exits once every handle has been dropped and
/// the backlog is written.
pub fn spawn_persistence_sink(
    store: Box<dyn InspectionStore>,
    retry: RetryPolicy,
    stats: Arc<InspectionStats>,
) -> std::io::Result<(PersistenceHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let handle = telemetry::spawn_thread("inspection-persistence", move || {
        write_loop(store, rx, retry, &stats)
    })?;
    Ok((PersistenceHandle { tx }, handle))
}

fn write_loop(
    mut store: Box<dyn InspectionStore>,
    rx: Receiver<SinkRecord>,
    retry: RetryPolicy,
    stats: &InspectionStats,
) {
    for record in rx.iter() {
        let (roller_id, kind) = match &record {
            SinkRecord::Verdict(verdict) => (verdict.roller_id, "verdict"),
            SinkRecord::Outcome(outcome) => (outcome.roller_id, "outcome"),
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match &record {
                SinkRecord::Verdict(verdict) => store.write_verdict(verdict),
                SinkRecord::Outcome(outcome) => store.write_outcome(outcome),
            };
            match result {
                Ok(()) => {
                    debug!(roller = %roller_id, kind, attempt, "record persisted");
                    break;
                }
                Err(err) if attempt < retry.max_attempts => {
                    let backoff = retry.backoff(attempt);
                    warn!(roller = %roller_id, kind, attempt, ?backoff, "persist failed: {err}");
                    thread::sleep(backoff);
                }
                Err(err) => {
                    error!(roller = %roller_id, kind, attempt, "giving up on record: {err}");
                    stats.persistence_failed();
                    break;
                }
            }
        }
    }
    debug!("persistence sink drained");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use line_ingest::RollerId;

    use super::*;
    use crate::pipeline::data::{Action, Decision, RollerOutcome};

    fn verdict(roller: u64) -> Verdict {
        Verdict {
            roller_id: RollerId(roller),
            decision: Decision::Accept,
            contributing_detections: Vec::new(),
            defect_classes: Vec::new(),
            reported_cameras: Vec::new(),
            missing_cameras: Vec::new(),
            degraded: false,
            forced: false,
            decided_at: Utc::now(),
            decision_latency: Duration::from_millis(12),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
        assert_eq!(retry.backoff(4), Duration::from_millis(50));
        assert_eq!(retry.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn sink_retries_transient_failures() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let stats = Arc::new(InspectionStats::new());
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let (handle, join) =
            spawn_persistence_sink(Box::new(store.clone()), retry, stats.clone()).unwrap();
        handle.verdict(Arc::new(verdict(1)));
        handle.outcome(OutcomeRecord::now(
            RollerId(1),
            RollerOutcome::Actuated {
                action: Action::Pass,
                command_sent: false,
            },
        ));
        drop(handle);
        join.join().unwrap();

        assert_eq!(store.verdicts().len(), 1);
        assert_eq!(store.outcomes().len(), 1);
        assert_eq!(stats.snapshot().persistence_failures, 0);
    }

    #[test]
    fn sink_gives_up_after_max_attempts() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let stats = Arc::new(InspectionStats::new());
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let (handle, join) =
            spawn_persistence_sink(Box::new(store.clone()), retry, stats.clone()).unwrap();
        handle.verdict(Arc::new(verdict(1)));
        handle.verdict(Arc::new(verdict(2)));
        drop(handle);
        join.join().unwrap();

        let persisted: Vec<_> = store.verdicts().iter().map(|v| v.roller_id).collect();
        assert_eq!(persisted, vec![RollerId(2)]);
        assert_eq!(stats.snapshot().persistence_failures, 1);
    }

    #[test]
    fn json_lines_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records").join("verdicts.jsonl");
        let original = verdict(4);
        {
            let mut store = JsonLinesStore::open(&path).unwrap();
            store.write_verdict(&original).unwrap();
            store
                .write_outcome(&OutcomeRecord::now(
                    RollerId(4),
                    RollerOutcome::Actuated {
                        action: Action::Reject,
                        command_sent: true,
                    },
                ))
                .unwrap();
        }
        let records = JsonLinesStore::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], StoredRecord::Verdict(original));
        assert!(matches!(
            &records[1],
            StoredRecord::Outcome(OutcomeRecord {
                outcome: RollerOutcome::Actuated { command_sent: true, .. },
                ..
            })
        ));
    }
}
