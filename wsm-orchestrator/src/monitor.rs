//! Abnormal-stop detection.
//!
//! The watcher forwards adapter events into a bounded channel; the dispatch
//! loop hands each one to its own task so it never waits on a machine lock.
//! Confirmed crashes go to a fixed pool of handler workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wsm_provider::{Infrastructure, InstanceEvent, InstanceEventKind};

use crate::error::OrchestratorError;
use crate::machine::Machine;
use crate::orchestrator::MachineOrchestrator;

/// Notification that a running machine stopped without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbnormalStopEvent {
    pub machine_id: String,
    pub workspace_id: String,
    pub error: String,
}

#[async_trait]
pub trait AbnormalMachineStopHandler: Send + Sync {
    async fn on_abnormal_stop(&self, event: &AbnormalStopEvent);
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Handler worker tasks.
    pub workers: usize,
    /// Capacity of both the event channel and the handler queue.
    pub queue: usize,
    /// Pause before re-attaching to the provider event stream.
    pub reconnect_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: 256,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub struct AbnormalStopMonitor {
    orchestrator: MachineOrchestrator,
    jobs: async_channel::Sender<AbnormalStopEvent>,
    config: MonitorConfig,
}

/// Background tasks of a running monitor.
pub struct MonitorTasks {
    pub watcher: JoinHandle<()>,
    pub dispatcher: JoinHandle<()>,
}

impl MonitorTasks {
    pub fn abort(&self) {
        self.watcher.abort();
        self.dispatcher.abort();
    }
}

impl AbnormalStopMonitor {
    /// Build the monitor and start its handler workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        orchestrator: MachineOrchestrator,
        handlers: Vec<Arc<dyn AbnormalMachineStopHandler>>,
        config: MonitorConfig,
    ) -> Self {
        let (jobs, queue) = async_channel::bounded(config.queue.max(1));
        let handlers: Arc<[Arc<dyn AbnormalMachineStopHandler>]> = handlers.into();

        for worker in 0..config.workers.max(1) {
            let queue = queue.clone();
            let handlers = handlers.clone();
            tokio::spawn(async move {
                while let Ok(event) = queue.recv().await {
                    for handler in handlers.iter() {
                        handler.on_abnormal_stop(&event).await;
                    }
                }
                debug!(worker, "Abnormal stop handler worker exiting");
            });
        }

        Self {
            orchestrator,
            jobs,
            config,
        }
    }

    /// Attach to the provider event stream and dispatch what it reports.
    pub fn spawn(self: Arc<Self>, infra: Arc<dyn Infrastructure>) -> MonitorTasks {
        let (tx, mut rx) = mpsc::channel(self.config.queue.max(1));
        let reconnect_delay = self.config.reconnect_delay;

        let watcher = tokio::spawn(async move {
            loop {
                match infra.watch(tx.clone()).await {
                    Ok(()) if tx.is_closed() => break,
                    Ok(()) => warn!("Instance event stream ended, reconnecting"),
                    Err(e) => error!("Instance event stream failed: {}", e),
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        });

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.dispatch(event);
            }
        });

        MonitorTasks {
            watcher,
            dispatcher,
        }
    }

    /// Handle one instance event on its own task.
    pub fn dispatch(&self, event: InstanceEvent) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            let machine = match orchestrator.get_machine(&event.machine_id) {
                Ok(machine) => machine,
                Err(_) => {
                    debug!(machine_id = %event.machine_id, "Event for unknown machine ignored");
                    return;
                }
            };

            let message = describe(&event, &machine);
            match orchestrator
                .on_abnormal_stop_at(&machine.id, &message, event.at)
                .await
            {
                Ok(machine) => {
                    info!(machine_id = %machine.id, "Abnormal stop confirmed");
                    let notification = AbnormalStopEvent {
                        machine_id: machine.id,
                        workspace_id: machine.workspace_id,
                        error: message,
                    };
                    if jobs.try_send(notification).is_err() {
                        warn!(machine_id = %event.machine_id, "Handler queue full, dropping abnormal stop notification");
                    }
                }
                Err(e) if e.is_stale_state() => {
                    debug!(machine_id = %event.machine_id, "Ignoring stop of machine that was not running: {}", e);
                }
                Err(OrchestratorError::NotFound(_)) => {
                    debug!(machine_id = %event.machine_id, "Machine removed before its stop event was handled");
                }
                Err(e) => error!(machine_id = %event.machine_id, "Failed to record abnormal stop: {}", e),
            }
        })
    }
}

fn describe(event: &InstanceEvent, machine: &Machine) -> String {
    match event.kind {
        InstanceEventKind::OutOfMemory => match machine.spec.memory_limit_mb {
            Some(mb) => format!(
                "Machine ran out of memory. It was started with a {mb}MB limit; \
                 give it more RAM and start it again."
            ),
            None => "Machine ran out of memory.".to_string(),
        },
        InstanceEventKind::Died => match event.exit_code {
            Some(code) => format!("Machine stopped unexpectedly with exit code {code}."),
            None => "Machine stopped unexpectedly.".to_string(),
        },
    }
}
