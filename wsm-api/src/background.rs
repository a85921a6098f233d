use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wsm_orchestrator::{
    follow, spawn_sweeper, AbnormalMachineStopHandler, AbnormalStopEvent, AbnormalStopMonitor,
    MonitorConfig, MonitorTasks,
};

use crate::state::AppState;

/// Reports abnormal stops to the service log.
pub struct LoggingStopHandler;

#[async_trait]
impl AbnormalMachineStopHandler for LoggingStopHandler {
    async fn on_abnormal_stop(&self, event: &AbnormalStopEvent) {
        warn!(
            machine_id = %event.machine_id,
            workspace_id = %event.workspace_id,
            "Machine stopped abnormally: {}",
            event.error
        );
    }
}

/// Activity follower, idle sweeper and abnormal-stop monitor of a running service.
pub struct BackgroundTasks {
    follower: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    monitor: MonitorTasks,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.follower.abort();
        self.sweeper.abort();
        self.monitor.abort();
    }
}

pub fn start_background_tasks(state: &AppState, monitor: MonitorConfig) -> BackgroundTasks {
    let sweep_interval = state.activity.config().sweep_interval;

    let follower = follow(state.activity.clone(), state.orchestrator.clone());
    let sweeper = spawn_sweeper(
        state.activity.clone(),
        state.orchestrator.clone(),
        sweep_interval,
    );
    info!(
        "Idle sweeper started (interval: {}s)",
        sweep_interval.as_secs()
    );

    let handlers: Vec<Arc<dyn AbnormalMachineStopHandler>> = vec![Arc::new(LoggingStopHandler)];
    let workers = monitor.workers;
    let monitor = Arc::new(AbnormalStopMonitor::new(
        state.orchestrator.clone(),
        handlers,
        monitor,
    ));
    let monitor = monitor.spawn(state.orchestrator.infrastructure().clone());
    info!("Abnormal-stop monitor started ({} handler workers)", workers);

    BackgroundTasks {
        follower,
        sweeper,
        monitor,
    }
}
