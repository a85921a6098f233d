//! Abnormal-stop monitor tests against the mock adapter's event stream.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{orchestrator, running_machine};
use tokio::sync::Notify;
use wsm_orchestrator::{
    AbnormalMachineStopHandler, AbnormalStopEvent, AbnormalStopMonitor, MachineState,
    MonitorConfig, StopOptions,
};
use wsm_provider::InstanceEvent;

#[derive(Default)]
struct CollectingHandler {
    events: Mutex<Vec<AbnormalStopEvent>>,
    notify: Notify,
}

impl CollectingHandler {
    fn events(&self) -> Vec<AbnormalStopEvent> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.events.lock().unwrap().len() < count {
                self.notify.notified().await;
            }
        })
        .await
        .expect("handler was not called in time");
    }
}

#[async_trait]
impl AbnormalMachineStopHandler for CollectingHandler {
    async fn on_abnormal_stop(&self, event: &AbnormalStopEvent) {
        self.events.lock().unwrap().push(event.clone());
        self.notify.notify_one();
    }
}

/// Never returns; occupies its worker.
struct StuckHandler;

#[async_trait]
impl AbnormalMachineStopHandler for StuckHandler {
    async fn on_abnormal_stop(&self, _event: &AbnormalStopEvent) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn test_container_death_crashes_machine_and_notifies_once() {
    let (mock, orchestrator) = orchestrator().await;
    let handler = Arc::new(CollectingHandler::default());
    let monitor = Arc::new(AbnormalStopMonitor::new(
        orchestrator.clone(),
        vec![handler.clone() as Arc<dyn AbnormalMachineStopHandler>],
        MonitorConfig::default(),
    ));
    let tasks = monitor.spawn(orchestrator.infrastructure().clone());

    let machine = running_machine(&orchestrator, "w1").await;
    // Give the watcher a chance to attach.
    tokio::time::sleep(Duration::from_millis(20)).await;
    mock.kill_machine(&machine.id, 137).await;

    handler.wait_for(1).await;
    tasks.abort();

    let events = handler.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].machine_id, machine.id);
    assert_eq!(events[0].workspace_id, "w1");
    assert!(events[0].error.contains("137"));

    let crashed = orchestrator.get_machine(&machine.id).unwrap();
    assert_eq!(crashed.state, MachineState::Crashed);
    assert_eq!(crashed.error.as_deref(), Some(events[0].error.as_str()));
}

#[tokio::test]
async fn test_oom_message_mentions_memory_limit() {
    let (_, orchestrator) = orchestrator().await;
    let handler = Arc::new(CollectingHandler::default());
    let monitor = AbnormalStopMonitor::new(
        orchestrator.clone(),
        vec![handler.clone() as Arc<dyn AbnormalMachineStopHandler>],
        MonitorConfig::default(),
    );
    let machine = running_machine(&orchestrator, "w1").await;

    monitor
        .dispatch(InstanceEvent::out_of_memory(
            machine.id.clone(),
            machine.instance_ref(),
        ))
        .await
        .unwrap();
    handler.wait_for(1).await;

    assert!(handler.events()[0].error.contains("2048MB"));
}

#[tokio::test]
async fn test_stop_of_stopped_machine_is_ignored() {
    let (_, orchestrator) = orchestrator().await;
    let handler = Arc::new(CollectingHandler::default());
    let monitor = AbnormalStopMonitor::new(
        orchestrator.clone(),
        vec![handler.clone() as Arc<dyn AbnormalMachineStopHandler>],
        MonitorConfig::default(),
    );
    let machine = running_machine(&orchestrator, "w1").await;
    orchestrator
        .stop_machine(&machine.id, StopOptions::default())
        .await
        .unwrap();

    monitor
        .dispatch(InstanceEvent::died(machine.id.clone(), machine.instance_ref(), Some(0)))
        .await
        .unwrap();
    monitor
        .dispatch(InstanceEvent::died("unknown", "c-unknown", Some(1)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(handler.events().is_empty());
    assert_eq!(
        orchestrator.get_machine(&machine.id).unwrap().state,
        MachineState::Stopped
    );
}

#[tokio::test]
async fn test_stop_event_from_before_restart_is_ignored() {
    let (_, orchestrator) = orchestrator().await;
    let handler = Arc::new(CollectingHandler::default());
    let monitor = AbnormalStopMonitor::new(
        orchestrator.clone(),
        vec![handler.clone() as Arc<dyn AbnormalMachineStopHandler>],
        MonitorConfig::default(),
    );
    let machine = running_machine(&orchestrator, "w1").await;
    orchestrator
        .stop_machine(&machine.id, StopOptions::default())
        .await
        .unwrap();
    let stopped_at = Utc::now();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let restarted = orchestrator.restart_machine(&machine.id).await.unwrap();
    assert!(restarted.running_since.unwrap() > stopped_at);

    // The die event of the intentional stop arrives late.
    monitor
        .dispatch(
            InstanceEvent::died(machine.id.clone(), machine.instance_ref(), Some(0))
                .observed_at(stopped_at),
        )
        .await
        .unwrap();
    assert!(handler.events().is_empty());
    assert_eq!(
        orchestrator.get_machine(&machine.id).unwrap().state,
        MachineState::Running
    );

    monitor
        .dispatch(
            InstanceEvent::died(machine.id.clone(), machine.instance_ref(), Some(137))
                .observed_at(Utc::now()),
        )
        .await
        .unwrap();
    handler.wait_for(1).await;
    assert_eq!(
        orchestrator.get_machine(&machine.id).unwrap().state,
        MachineState::Crashed
    );
}

#[tokio::test]
async fn test_stuck_handler_does_not_block_detection() {
    let (_, orchestrator) = orchestrator().await;
    let monitor = AbnormalStopMonitor::new(
        orchestrator.clone(),
        vec![Arc::new(StuckHandler) as Arc<dyn AbnormalMachineStopHandler>],
        MonitorConfig {
            workers: 1,
            queue: 1,
            ..MonitorConfig::default()
        },
    );

    let mut machines = Vec::new();
    for i in 0..4 {
        machines.push(running_machine(&orchestrator, &format!("w{i}")).await);
    }

    for machine in &machines {
        let dispatched = monitor.dispatch(InstanceEvent::died(
            machine.id.clone(),
            machine.instance_ref(),
            Some(137),
        ));
        tokio::time::timeout(Duration::from_secs(5), dispatched)
            .await
            .expect("dispatch blocked on a stuck handler")
            .unwrap();
    }

    for machine in &machines {
        assert_eq!(
            orchestrator.get_machine(&machine.id).unwrap().state,
            MachineState::Crashed
        );
    }
}
