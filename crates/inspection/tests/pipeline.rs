mod common;

use std::time::Duration;

use common::{Line, View, line_config, wait_until};
use inspection::{
    Action, AlertKind, Decision, DropReason, IntakeState, JsonLinesStore, LinkStatus,
    MemoryStore, PauseReason, RollerOutcome, RollerState, StoredRecord,
};
use line_ingest::{CameraId, RollerId};

const SETTLE: Duration = Duration::from_secs(3);

fn finished(line: &Line, roller_id: RollerId) -> bool {
    line.coordinator
        .rollers()
        .state_of(roller_id)
        .is_some_and(RollerState::is_terminal)
}

#[test]
fn clean_views_accept_without_a_command() {
    let line = Line::start(line_config(&[1, 2]), Box::new(MemoryStore::new()));
    let roller = line.enter();
    line.show(0, roller, View::Clean);
    line.show(1, roller, View::Clean);

    assert!(wait_until(SETTLE, || finished(&line, roller)));
    let verdict = line.coordinator.rollers().verdict_of(roller).unwrap();
    assert_eq!(verdict.decision, Decision::Accept);
    assert_eq!(verdict.reported_cameras, vec![CameraId(1), CameraId(2)]);
    assert_eq!(
        line.coordinator.rollers().state_of(roller),
        Some(RollerState::Actuated)
    );
    assert!(line.plc.commands().is_empty());
}

#[test]
fn confident_crack_on_one_view_rejects() {
    let line = Line::start(line_config(&[1, 2]), Box::new(MemoryStore::new()));
    let roller = line.enter();
    line.show(0, roller, View::Clean);
    line.show(1, roller, View::Crack(0.92));

    assert!(wait_until(SETTLE, || finished(&line, roller)));
    let verdict = line.coordinator.rollers().verdict_of(roller).unwrap();
    assert_eq!(verdict.decision, Decision::Reject);
    assert_eq!(verdict.defect_classes, vec!["crack".to_string()]);

    let commands = line.plc.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].roller_id, roller);
    assert_eq!(commands[0].action, Action::Reject);
    assert_eq!(line.coordinator.stats().rejected, 1);
}

#[test]
fn crack_below_threshold_still_accepts() {
    let line = Line::start(line_config(&[1, 2]), Box::new(MemoryStore::new()));
    let roller = line.enter();
    line.show(0, roller, View::Crack(0.5));
    line.show(1, roller, View::Clean);

    assert!(wait_until(SETTLE, || finished(&line, roller)));
    let verdict = line.coordinator.rollers().verdict_of(roller).unwrap();
    assert_eq!(verdict.decision, Decision::Accept);
    assert_eq!(verdict.contributing_detections.len(), 1);
}

#[test]
fn missing_view_after_deadline_is_inconclusive() {
    let line = Line::start(line_config(&[1, 2]), Box::new(MemoryStore::new()));
    let roller = line.enter();
    line.show(0, roller, View::Clean);

    assert!(wait_until(SETTLE, || {
        line.coordinator.rollers().verdict_of(roller).is_some()
    }));
    let verdict = line.coordinator.rollers().verdict_of(roller).unwrap();
    assert_eq!(verdict.decision, Decision::Inconclusive);
    assert_eq!(verdict.missing_cameras, vec![CameraId(2)]);
    assert!(verdict.decision_latency >= Duration::from_millis(200));

    assert!(wait_until(SETTLE, || finished(&line, roller)));
    assert_eq!(line.plc.commands()[0].action, Action::Reject);
}

#[test]
fn decision_past_the_transit_budget_is_dropped() {
    let mut config = line_config(&[1]);
    config.line.transit_distance_mm = 20.0;
    config.actuation.command_lead_ms = 5;
    config.actuation.plc_timeout_ms = 2;
    let line = Line::start(config, Box::new(MemoryStore::new()));
    let roller = line.enter();
    line.show(0, roller, View::Slow(Duration::from_millis(50)));

    assert!(wait_until(SETTLE, || finished(&line, roller)));
    assert_eq!(
        line.coordinator.rollers().state_of(roller),
        Some(RollerState::Dropped)
    );
    assert!(line.plc.commands().is_empty());
    assert!(wait_until(SETTLE, || line.coordinator.stats().timing_violations == 1));
    assert!(wait_until(SETTLE, || {
        line.coordinator
            .alerts()
            .iter()
            .any(|alert| alert.kind == AlertKind::TimingViolation)
    }));
}

#[test]
fn full_queue_degrades_the_roller_that_lost_its_view() {
    let mut config = line_config(&[1]);
    config.queue.capacity = 1;
    config.queue.push_timeout_ms = 5;
    config.workers.count = 1;
    let line = Line::start(config, Box::new(MemoryStore::new()));
    let busy = line.enter();
    let queued = line.enter();
    let starved = line.enter();

    line.show(0, busy, View::Slow(Duration::from_millis(200)));
    assert!(wait_until(SETTLE, || {
        line.coordinator.stats().frames_queued == 1 && line.coordinator.health().queue_depth == 0
    }));
    line.show(0, queued, View::Clean);
    assert!(wait_until(SETTLE, || line.coordinator.health().queue_depth == 1));
    line.show(0, starved, View::Clean);

    assert!(wait_until(SETTLE, || finished(&line, starved)));
    let verdict = line.coordinator.rollers().verdict_of(starved).unwrap();
    assert!(verdict.degraded);
    assert_eq!(verdict.decision, Decision::Inconclusive);
    assert_eq!(verdict.missing_cameras, vec![CameraId(1)]);
    let stats = line.coordinator.stats();
    assert_eq!(stats.frames_lost, 1);
    assert!(stats.degraded >= 1);

    assert!(wait_until(SETTLE, || finished(&line, busy) && finished(&line, queued)));
    for roller in [busy, queued] {
        let verdict = line.coordinator.rollers().verdict_of(roller).unwrap();
        assert!(!verdict.degraded);
        assert_eq!(verdict.decision, Decision::Accept);
    }
}

#[test]
fn failed_send_drops_the_roller_and_marks_the_plc_down() {
    let mut config = line_config(&[1]);
    config.line.transit_distance_mm = 100.0;
    config.supervision.health_interval_ms = 2_000;
    config.supervision.plc_link_grace_ms = 60_000;
    let line = Line::start(config, Box::new(MemoryStore::new()));
    line.plc.fail_sends(true);
    let roller = line.enter();
    line.show(0, roller, View::Crack(0.95));

    assert!(wait_until(SETTLE, || finished(&line, roller)));
    assert_eq!(
        line.coordinator.rollers().state_of(roller),
        Some(RollerState::Dropped)
    );
    assert_eq!(
        line.coordinator.rollers().verdict_of(roller).unwrap().decision,
        Decision::Reject
    );
    assert!(line.plc.commands().is_empty());
    assert!(wait_until(SETTLE, || line.coordinator.stats().link_errors == 1));
    assert!(wait_until(SETTLE, || {
        line.coordinator
            .alerts()
            .iter()
            .any(|alert| alert.kind == AlertKind::LinkError)
    }));
    let health = line.coordinator.health();
    assert_eq!(health.plc_status, LinkStatus::Down);
    assert_eq!(health.intake, IntakeState::Running);
}

#[test]
fn plc_outage_past_grace_pauses_intake_until_link_returns() {
    let mut config = line_config(&[1, 2]);
    config.supervision.plc_link_grace_ms = 100;
    let line = Line::start(config, Box::new(MemoryStore::new()));
    assert_eq!(line.coordinator.health().intake, IntakeState::Running);

    line.plc.set_up(false);
    assert!(wait_until(SETTLE, || {
        line.coordinator.health().intake == IntakeState::Paused
    }));
    let health = line.coordinator.health();
    assert_eq!(health.plc_status, LinkStatus::Down);
    assert_eq!(health.pause_reasons, vec![PauseReason::LinkLoss]);
    assert!(
        line.coordinator
            .alerts()
            .iter()
            .any(|alert| alert.kind == AlertKind::LinkLoss)
    );

    let roller = line.enter();
    line.show(0, roller, View::Clean);
    assert!(wait_until(SETTLE, || line.coordinator.stats().frames_paused >= 1));

    line.plc.set_up(true);
    assert!(wait_until(SETTLE, || {
        line.coordinator.health().intake == IntakeState::Running
    }));
    assert_eq!(line.coordinator.health().plc_status, LinkStatus::Up);
}

#[test]
fn operator_pause_and_resume() {
    let line = Line::start(line_config(&[1]), Box::new(MemoryStore::new()));
    assert_eq!(line.coordinator.pause(), IntakeState::Paused);
    assert_eq!(line.coordinator.health().pause_reasons, vec![PauseReason::Operator]);
    assert_eq!(line.coordinator.resume(), IntakeState::Running);
}

#[test]
fn shutdown_settles_rollers_in_flight() {
    let store = MemoryStore::new();
    let line = Line::start(line_config(&[1, 2]), Box::new(store.clone()));
    let roller = line.enter();
    line.show(0, roller, View::Clean);
    line.coordinator.shutdown().unwrap();

    let verdicts = store.verdicts();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].roller_id, roller);
    assert_eq!(store.outcomes().len(), 1);
    assert_eq!(line.coordinator.health().intake, IntakeState::Stopped);
}

#[test]
fn persisted_verdict_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.jsonl");
    let line = Line::start(
        line_config(&[1, 2]),
        Box::new(JsonLinesStore::open(&path).unwrap()),
    );
    let roller = line.enter();
    line.show(0, roller, View::Crack(0.92));
    line.show(1, roller, View::Clean);
    assert!(wait_until(SETTLE, || finished(&line, roller)));
    let verdict = line.coordinator.rollers().verdict_of(roller).unwrap();
    line.coordinator.shutdown().unwrap();

    let records = JsonLinesStore::read_records(&path).unwrap();
    let stored: Vec<_> = records
        .iter()
        .filter_map(|record| match record {
            StoredRecord::Verdict(stored) => Some(stored),
            StoredRecord::Outcome(_) => None,
        })
        .collect();
    assert_eq!(stored, vec![&*verdict]);
    assert!(records.iter().any(|record| matches!(
        record,
        StoredRecord::Outcome(outcome)
            if outcome.roller_id == roller
                && outcome.outcome
                    == (RollerOutcome::Actuated { action: Action::Reject, command_sent: true })
    )));
    assert!(!records.iter().any(|record| matches!(
        record,
        StoredRecord::Outcome(outcome)
            if outcome.outcome == (RollerOutcome::Dropped { reason: DropReason::Shutdown })
    )));
}
