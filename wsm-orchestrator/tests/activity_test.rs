//! Idle expiry tests: the sweeper on a paused clock, and the whole idle path
//! (activity, sweep, snapshot, stop) against the mock adapter.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{orchestrator, running_machine, spec, wait_until};
use tokio::time::Instant;
use wsm_orchestrator::{
    follow, spawn_sweeper, ActivityConfig, ActivityTracker, IdleTimeoutHandler, Machine,
    MachineState, OrchestratorError, Result, StartMachineRequest, StopOptions,
};
use wsm_provider::mock::MockOp;
use wsm_provider::InfraError;

const IDLE: Duration = Duration::from_secs(60);
const SWEEP: Duration = Duration::from_secs(5);

/// Records when each workspace expired; fails the first `failures` calls.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<(String, Instant)>>>,
    failures: Arc<Mutex<usize>>,
}

impl Recorder {
    fn failing(times: usize) -> Self {
        let recorder = Self::default();
        *recorder.failures.lock().unwrap() = times;
        recorder
    }

    fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdleTimeoutHandler for Recorder {
    async fn on_idle_timeout(&self, workspace_id: &str) -> Result<Option<Machine>> {
        self.calls
            .lock()
            .unwrap()
            .push((workspace_id.to_string(), Instant::now()));

        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(OrchestratorError::Infrastructure(InfraError::Transient(
                "daemon restarting".into(),
            )));
        }
        Ok(None)
    }
}

fn tracker() -> Arc<ActivityTracker> {
    Arc::new(ActivityTracker::new(ActivityConfig {
        idle_timeout: Some(IDLE),
        run_timeout: None,
        sweep_interval: SWEEP,
    }))
}

#[tokio::test(start_paused = true)]
async fn test_idle_fires_once_within_one_sweep_of_deadline() {
    let tracker = tracker();
    let recorder = Recorder::default();
    let t0 = Instant::now();
    tracker.record_activity_at("w1", t0);

    let sweeper = spawn_sweeper(tracker.clone(), recorder.clone(), SWEEP);
    tokio::time::sleep(IDLE + SWEEP * 4).await;
    sweeper.abort();

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "w1");
    assert!(calls[0].1 >= t0 + IDLE);
    assert!(calls[0].1 <= t0 + IDLE + SWEEP);
}

#[tokio::test(start_paused = true)]
async fn test_activity_postpones_expiry() {
    let tracker = tracker();
    let recorder = Recorder::default();
    tracker.record_activity("w1");
    let sweeper = spawn_sweeper(tracker.clone(), recorder.clone(), SWEEP);

    tokio::time::sleep(Duration::from_secs(40)).await;
    tracker.record_activity("w1");
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(recorder.calls().is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    sweeper.abort();
    assert_eq!(recorder.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_stop_is_retried_on_next_sweep() {
    let tracker = tracker();
    let recorder = Recorder::failing(1);
    tracker.record_activity("w1");

    let sweeper = spawn_sweeper(tracker.clone(), recorder.clone(), SWEEP);
    tokio::time::sleep(IDLE + SWEEP * 3).await;
    sweeper.abort();

    let calls = recorder.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].1 - calls[0].1 >= SWEEP);
}

#[tokio::test]
async fn test_follow_tracks_running_machines() {
    let (_, orchestrator) = orchestrator().await;
    let tracker = tracker();
    let follower = follow(tracker.clone(), orchestrator.clone());

    let machine = running_machine(&orchestrator, "w1").await;
    wait_until(|| tracker.get("w1").is_some_and(|r| r.running_since.is_some())).await;
    assert!(tracker.get("w1").unwrap().armed);

    orchestrator
        .stop_machine(&machine.id, Default::default())
        .await
        .unwrap();
    wait_until(|| tracker.get("w1").is_some_and(|r| r.running_since.is_none())).await;
    assert!(!tracker.get("w1").unwrap().armed);

    follower.abort();
}

#[tokio::test]
async fn test_idle_workspace_is_snapshotted_and_stopped() {
    let (mock, orchestrator) = orchestrator().await;
    let idle = Duration::from_millis(300);
    let tracker = Arc::new(ActivityTracker::new(ActivityConfig {
        idle_timeout: Some(idle),
        run_timeout: None,
        sweep_interval: Duration::from_millis(20),
    }));
    let follower = follow(tracker.clone(), orchestrator.clone());
    let sweeper = spawn_sweeper(tracker.clone(), orchestrator.clone(), Duration::from_millis(20));

    let machine = running_machine(&orchestrator, "w1").await;
    tracker.record_activity("w1");
    let active_at = Instant::now();

    tokio::time::sleep(idle / 2).await;
    assert_eq!(
        orchestrator.get_machine(&machine.id).unwrap().state,
        MachineState::Running
    );

    wait_until(|| {
        orchestrator
            .get_machine(&machine.id)
            .is_ok_and(|m| m.state == MachineState::Stopped)
    })
    .await;
    assert!(active_at.elapsed() >= idle);

    sweeper.abort();
    follower.abort();

    assert_eq!(mock.calls(MockOp::Snapshot), 1);
    assert_eq!(mock.calls(MockOp::Stop), 1);
    let snapshots = orchestrator.list_snapshots("w1").await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].machine_id, machine.id);
    assert!(!mock.is_running(machine.instance_ref()));
}

#[tokio::test]
async fn test_second_start_keeps_running_machine_tracked() {
    let (mock, orchestrator) = orchestrator().await;
    let tracker = tracker();
    let follower = follow(tracker.clone(), orchestrator.clone());

    let machine = running_machine(&orchestrator, "w1").await;
    wait_until(|| tracker.get("w1").is_some_and(|r| r.running_since.is_some())).await;

    let err = orchestrator
        .start_machine(StartMachineRequest::new("w1", spec()))
        .await
        .unwrap_err();
    assert!(err.is_stale_state());
    assert_eq!(mock.calls(MockOp::Create), 1);
    assert_eq!(orchestrator.list_machines(&Default::default()).len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = tracker.get("w1").unwrap();
    assert!(record.armed);
    assert!(record.running_since.is_some());
    assert_eq!(tracker.sweep(Instant::now() + IDLE).len(), 1);

    follower.abort();
    assert_eq!(
        orchestrator.get_machine(&machine.id).unwrap().state,
        MachineState::Running
    );
}

#[tokio::test]
async fn test_removing_old_machine_keeps_new_one_tracked() {
    let (_, orchestrator) = orchestrator().await;
    let tracker = tracker();
    let follower = follow(tracker.clone(), orchestrator.clone());

    let old = running_machine(&orchestrator, "w1").await;
    orchestrator
        .stop_machine(&old.id, StopOptions::default())
        .await
        .unwrap();
    let new = running_machine(&orchestrator, "w1").await;
    orchestrator.remove_machine(&old.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = tracker.get("w1").expect("workspace still tracked");
    assert!(record.armed);
    assert!(record.running_since.is_some());

    // Once the last machine is gone the record goes with it.
    orchestrator
        .stop_machine(&new.id, StopOptions::default())
        .await
        .unwrap();
    orchestrator.remove_machine(&new.id).await.unwrap();
    wait_until(|| tracker.get("w1").is_none()).await;

    follower.abort();
}
