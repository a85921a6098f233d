//! Machine lifecycle state machine.
//!
//! Every transition takes the machine's transition lock first and holds it
//! until the adapter calls finish, so requests against one machine apply in
//! the order they arrived and a loser sees the winner's final state.
//!
//! Transitions that call the adapter run on their own task. A caller that
//! goes away (an HTTP client disconnecting, say) stops waiting for the
//! result but the transition still reaches a final state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;
use wsm_provider::{
    retry_with_backoff, InfraError, Infrastructure, InstanceKey, InstanceTarget, MachineSpec,
    ProvisionedInstance, RetryPolicy,
};

use crate::error::{OrchestratorError, Result};
use crate::machine::{
    Machine, MachineEvent, MachineFilter, MachineSource, MachineState, StartMachineRequest,
    StopOptions,
};
use crate::operation::{Operation, OperationFilter, OperationLog, OperationType};
use crate::registry::{MachineRegistry, MachineSlot, Transition};
use crate::snapshot::{Snapshot, SnapshotStore};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Default deadline for create/restore plus start.
    pub create_timeout: Duration,
    pub stop_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub retry: RetryPolicy,
    /// Capacity of the state change broadcast channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(120),
            snapshot_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }
}

struct Inner {
    infra: Arc<dyn Infrastructure>,
    registry: MachineRegistry,
    snapshots: SnapshotStore,
    operations: OperationLog,
    events: broadcast::Sender<MachineEvent>,
    config: OrchestratorConfig,
    pool: SqlitePool,
}

/// Owns every machine and serializes the transitions applied to each one.
#[derive(Clone)]
pub struct MachineOrchestrator {
    inner: Arc<Inner>,
}

impl MachineOrchestrator {
    pub fn new(infra: Arc<dyn Infrastructure>, pool: SqlitePool, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                infra,
                registry: MachineRegistry::default(),
                snapshots: SnapshotStore::new(pool.clone()),
                operations: OperationLog::new(pool.clone()),
                events,
                config,
                pool,
            }),
        }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn infrastructure(&self) -> &Arc<dyn Infrastructure> {
        &self.inner.infra
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Stream of state changes, in the order they were applied per machine.
    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.inner.events.subscribe()
    }

    /// Create (or restore) a machine and start it.
    #[instrument(skip(self, req), fields(workspace_id = %req.workspace_id))]
    pub async fn start_machine(&self, req: StartMachineRequest) -> Result<Machine> {
        let this = self.clone();
        self.detach(async move { this.run_start(req).await }).await
    }

    async fn run_start(&self, req: StartMachineRequest) -> Result<Machine> {
        if req.workspace_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "workspace_id must not be empty".into(),
            ));
        }
        let source = req.source();
        if req.spec.image.trim().is_empty() && !matches!(source, MachineSource::Snapshot(_)) {
            return Err(OrchestratorError::InvalidInput(
                "spec.image must not be empty".into(),
            ));
        }

        let target = InstanceTarget::new(Uuid::new_v4().to_string(), req.workspace_id.as_str());
        let slot = self
            .inner
            .registry
            .insert(Machine::new(&target, self.inner.infra.name(), req.spec.clone()))
            .map_err(|active| {
                OrchestratorError::stale(&active.id, "stopped, crashed or failed", active.state)
            })?;
        let tx = slot.begin().await;
        self.publish(&tx.machine());

        let operation_type = match source {
            MachineSource::Spec => OperationType::Start,
            MachineSource::Snapshot(_) | MachineSource::Recover => OperationType::Restore,
        };
        let op = self
            .inner
            .operations
            .begin(&target.machine_id, &target.workspace_id, operation_type)
            .await;

        let deadline = req.deadline().unwrap_or(self.inner.config.create_timeout);
        match timeout(deadline, self.provision(&tx, &target, &req.spec, source)).await {
            Ok(Ok(())) => {
                let machine = tx.update(|m| {
                    m.state = MachineState::Running;
                    m.running_since = Some(Utc::now());
                    m.error = None;
                });
                info!(machine_id = %machine.id, instance = %machine.instance_ref(), "Machine running");
                self.publish(&machine);
                self.inner.operations.finish(op, None).await;
                Ok(machine)
            }
            Ok(Err(e)) => Err(self.fail(&tx, op, e).await),
            Err(_) => {
                self.discard_instance(&tx).await;
                let e = OrchestratorError::Timeout {
                    machine_id: target.machine_id.clone(),
                    phase: "creating",
                };
                Err(self.fail(&tx, op, e).await)
            }
        }
    }

    /// Stop a running machine, optionally snapshotting it first.
    #[instrument(skip(self, options), fields(machine_id = %id, snapshot = options.snapshot))]
    pub async fn stop_machine(&self, id: &str, options: StopOptions) -> Result<Machine> {
        let this = self.clone();
        let id = id.to_string();
        self.detach(async move { this.run_stop(&id, options).await })
            .await
    }

    async fn run_stop(&self, id: &str, options: StopOptions) -> Result<Machine> {
        let slot = self.slot(id)?;
        let tx = slot.begin().await;
        let machine = tx.machine();

        match machine.state {
            MachineState::Running => {}
            MachineState::Stopped => {
                debug!("Machine already stopped");
                return Ok(machine);
            }
            other => return Err(OrchestratorError::stale(id, "running", other)),
        }

        self.publish(&tx.set_state(MachineState::Stopping));

        if options.snapshot {
            let deadline = options
                .deadline()
                .unwrap_or(self.inner.config.snapshot_timeout);
            let op = self
                .inner
                .operations
                .begin(id, &machine.workspace_id, OperationType::Snapshot)
                .await;

            match self.capture(&machine, deadline).await {
                Ok(snapshot) => {
                    tx.update(|m| m.instance_key = Some(snapshot.instance_key.clone()));
                    self.inner.operations.finish(op, None).await;
                }
                Err(e @ OrchestratorError::Timeout { .. }) => {
                    self.discard_instance(&tx).await;
                    return Err(self.fail(&tx, op, e).await);
                }
                Err(e) => {
                    // The machine keeps running; nothing was stopped.
                    warn!("Snapshot failed, stop aborted: {}", e);
                    let message = e.to_string();
                    let machine = tx.update(|m| {
                        m.state = MachineState::Running;
                        m.error = Some(message.clone());
                    });
                    self.publish(&machine);
                    self.inner.operations.finish(op, Some(&message)).await;
                    return Err(e);
                }
            }
        }

        let op = self
            .inner
            .operations
            .begin(id, &machine.workspace_id, OperationType::Stop)
            .await;
        let deadline = options.deadline().unwrap_or(self.inner.config.stop_timeout);
        let infra = &self.inner.infra;
        let instance = machine.instance_ref();

        match timeout(deadline, self.adapter("stop", || infra.stop(instance))).await {
            Ok(Ok(())) => {
                let machine = tx.update(|m| {
                    m.state = MachineState::Stopped;
                    m.error = None;
                });
                info!("Machine stopped");
                self.publish(&machine);
                self.inner.operations.finish(op, None).await;
                Ok(machine)
            }
            Ok(Err(e)) => Err(self.fail(&tx, op, e).await),
            Err(_) => {
                let e = OrchestratorError::Timeout {
                    machine_id: id.to_string(),
                    phase: "stopping",
                };
                Err(self.fail(&tx, op, e).await)
            }
        }
    }

    /// Snapshot a running machine without stopping it.
    #[instrument(skip(self), fields(machine_id = %id))]
    pub async fn snapshot_machine(&self, id: &str, deadline: Option<Duration>) -> Result<Snapshot> {
        let this = self.clone();
        let id = id.to_string();
        self.detach(async move { this.run_snapshot(&id, deadline).await })
            .await
    }

    async fn run_snapshot(&self, id: &str, deadline: Option<Duration>) -> Result<Snapshot> {
        let slot = self.slot(id)?;
        let tx = slot.begin().await;
        let machine = tx.machine();

        if machine.state != MachineState::Running {
            return Err(OrchestratorError::stale(id, "running", machine.state));
        }

        let op = self
            .inner
            .operations
            .begin(id, &machine.workspace_id, OperationType::Snapshot)
            .await;
        let deadline = deadline.unwrap_or(self.inner.config.snapshot_timeout);

        match self.capture(&machine, deadline).await {
            Ok(snapshot) => {
                tx.update(|m| m.instance_key = Some(snapshot.instance_key.clone()));
                self.inner.operations.finish(op, None).await;
                info!(snapshot_id = %snapshot.id, "Snapshot saved");
                Ok(snapshot)
            }
            Err(e @ OrchestratorError::Timeout { .. }) => {
                self.discard_instance(&tx).await;
                Err(self.fail(&tx, op, e).await)
            }
            Err(e) => {
                warn!("Snapshot failed: {}", e);
                self.inner.operations.finish(op, Some(&e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Destroy the machine's instance and drop it from the registry.
    #[instrument(skip(self), fields(machine_id = %id))]
    pub async fn remove_machine(&self, id: &str) -> Result<()> {
        let this = self.clone();
        let id = id.to_string();
        self.detach(async move { this.run_remove(&id).await }).await
    }

    async fn run_remove(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let tx = slot.begin().await;
        let machine = tx.machine();

        if !machine.state.is_removable() {
            return Err(OrchestratorError::stale(
                id,
                "stopped, failed or crashed",
                machine.state,
            ));
        }

        let op = self
            .inner
            .operations
            .begin(id, &machine.workspace_id, OperationType::Remove)
            .await;
        let infra = &self.inner.infra;
        let instance = machine.instance_ref();

        match timeout(
            self.inner.config.stop_timeout,
            self.adapter("remove", || infra.remove(instance)),
        )
        .await
        {
            Ok(Ok(())) => {
                let machine = tx.set_state(MachineState::Removed);
                self.inner.registry.remove(id);
                info!("Machine removed");
                self.publish(&machine);
                self.inner.operations.finish(op, None).await;
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(&tx, op, e).await),
            Err(_) => {
                let e = OrchestratorError::Timeout {
                    machine_id: id.to_string(),
                    phase: "removing",
                };
                Err(self.fail(&tx, op, e).await)
            }
        }
    }

    /// Start a stopped or crashed machine again.
    #[instrument(skip(self), fields(machine_id = %id))]
    pub async fn restart_machine(&self, id: &str) -> Result<Machine> {
        let this = self.clone();
        let id = id.to_string();
        self.detach(async move { this.run_restart(&id).await }).await
    }

    async fn run_restart(&self, id: &str) -> Result<Machine> {
        let slot = self.slot(id)?;
        let tx = slot.begin().await;
        let machine = tx.machine();

        if !matches!(machine.state, MachineState::Stopped | MachineState::Crashed) {
            return Err(OrchestratorError::stale(id, "stopped or crashed", machine.state));
        }

        let op = self
            .inner
            .operations
            .begin(id, &machine.workspace_id, OperationType::Restart)
            .await;
        let infra = &self.inner.infra;
        let instance = machine.instance_ref();

        match timeout(
            self.inner.config.create_timeout,
            self.adapter("start", || infra.start(instance)),
        )
        .await
        {
            Ok(Ok(())) => {
                let machine = tx.update(|m| {
                    m.state = MachineState::Running;
                    m.running_since = Some(Utc::now());
                    m.error = None;
                });
                info!("Machine restarted");
                self.publish(&machine);
                self.inner.operations.finish(op, None).await;
                Ok(machine)
            }
            Ok(Err(e)) => Err(self.fail(&tx, op, e).await),
            Err(_) => {
                let e = OrchestratorError::Timeout {
                    machine_id: id.to_string(),
                    phase: "restarting",
                };
                Err(self.fail(&tx, op, e).await)
            }
        }
    }

    /// Snapshot and stop the workspace's running machine, if it has one.
    #[instrument(skip(self))]
    pub async fn on_idle_timeout(&self, workspace_id: &str) -> Result<Option<Machine>> {
        let running = self
            .inner
            .registry
            .for_workspace(workspace_id)
            .into_iter()
            .map(|slot| slot.snapshot())
            .find(|m| m.state == MachineState::Running);

        match running {
            Some(machine) => {
                info!(machine_id = %machine.id, "Workspace idle, stopping machine");
                self.stop_machine(&machine.id, StopOptions::with_snapshot())
                    .await
                    .map(Some)
            }
            None => {
                debug!("No running machine for idle workspace");
                Ok(None)
            }
        }
    }

    /// Mark a running machine as crashed after its container died underneath us.
    pub async fn on_abnormal_stop(&self, id: &str, error: &str) -> Result<Machine> {
        self.on_abnormal_stop_at(id, error, None).await
    }

    /// Like [`Self::on_abnormal_stop`], for a stop the provider observed at
    /// `observed_at`. A stop from before the machine last started running
    /// belongs to an earlier run and gives `StaleState`.
    #[instrument(skip(self, error), fields(machine_id = %id))]
    pub async fn on_abnormal_stop_at(
        &self,
        id: &str,
        error: &str,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<Machine> {
        let slot = self.slot(id)?;
        let tx = slot.begin().await;
        let current = tx.machine();

        if current.state != MachineState::Running {
            return Err(OrchestratorError::stale(id, "running", current.state));
        }
        if let (Some(at), Some(since)) = (observed_at, current.running_since) {
            if at < since {
                return Err(OrchestratorError::stale(
                    id,
                    "an earlier run",
                    current.state,
                ));
            }
        }

        let machine = tx.update(|m| {
            m.state = MachineState::Crashed;
            m.error = Some(error.to_string());
        });
        warn!(workspace_id = %machine.workspace_id, "Machine stopped abnormally: {}", error);
        self.publish(&machine);
        Ok(machine)
    }

    pub fn get_machine(&self, id: &str) -> Result<Machine> {
        Ok(self.slot(id)?.snapshot())
    }

    /// Oldest first.
    pub fn list_machines(&self, filter: &MachineFilter) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self
            .inner
            .registry
            .all()
            .into_iter()
            .map(|slot| slot.snapshot())
            .filter(|m| filter.matches(m))
            .collect();
        machines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        machines
    }

    /// The workspace's running machine, or else its most recently created one.
    pub fn machine_for_workspace(&self, workspace_id: &str) -> Option<Machine> {
        let mut machines: Vec<Machine> = self
            .inner
            .registry
            .for_workspace(workspace_id)
            .into_iter()
            .map(|slot| slot.snapshot())
            .collect();

        if let Some(pos) = machines.iter().position(|m| m.state == MachineState::Running) {
            return Some(machines.swap_remove(pos));
        }
        machines.into_iter().max_by_key(|m| m.created_at)
    }

    pub async fn list_snapshots(&self, workspace_id: &str) -> Result<Vec<Snapshot>> {
        self.inner.snapshots.list_for_workspace(workspace_id).await
    }

    /// Delete the stored image, then its record.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.inner.snapshots.get(snapshot_id).await?;
        let infra = &self.inner.infra;
        let key = &snapshot.instance_key;

        timeout(
            self.inner.config.stop_timeout,
            self.adapter("remove_snapshot", || infra.remove_snapshot(key)),
        )
        .await
        .map_err(|_| OrchestratorError::Timeout {
            machine_id: snapshot.machine_id.clone(),
            phase: "removing snapshot of",
        })??;

        self.inner.snapshots.delete(snapshot_id).await?;
        info!(workspace_id = %snapshot.workspace_id, "Snapshot deleted");
        Ok(())
    }

    pub async fn get_operation(&self, id: &str) -> Result<Operation> {
        self.inner.operations.get(id).await
    }

    pub async fn operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        self.inner.operations.list(filter).await
    }

    async fn detach<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(work.in_current_span())
            .await
            .map_err(|e| OrchestratorError::Internal(format!("Transition task failed: {e}")))?
    }

    fn slot(&self, id: &str) -> Result<Arc<MachineSlot>> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Machine {id}")))
    }

    fn publish(&self, machine: &Machine) {
        // No subscribers is fine.
        let _ = self.inner.events.send(MachineEvent::of(machine));
    }

    async fn adapter<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = wsm_provider::Result<T>>,
    {
        Ok(retry_with_backoff(&self.inner.config.retry, operation, f).await?)
    }

    async fn provision(
        &self,
        tx: &Transition<'_>,
        target: &InstanceTarget,
        spec: &MachineSpec,
        source: MachineSource,
    ) -> Result<()> {
        let infra = &self.inner.infra;
        let (instance, key) = match source {
            MachineSource::Spec => (self.adapter("create", || infra.create(target, spec)).await?, None),
            MachineSource::Snapshot(key) => {
                let instance = self
                    .adapter("restore", || infra.restore(target, &key, spec))
                    .await?;
                (instance, Some(key))
            }
            MachineSource::Recover => self.recover(target, spec).await?,
        };

        tx.update(|m| {
            m.name = instance.name.clone();
            m.instance_id = Some(instance.instance_id.clone());
            m.instance_key = key;
        });

        self.adapter("start", || infra.start(&instance.instance_id))
            .await
    }

    async fn recover(
        &self,
        target: &InstanceTarget,
        spec: &MachineSpec,
    ) -> Result<(ProvisionedInstance, Option<InstanceKey>)> {
        let infra = &self.inner.infra;

        match self
            .inner
            .snapshots
            .latest_for_workspace(&target.workspace_id)
            .await?
        {
            Some(snapshot) => {
                let key = &snapshot.instance_key;
                match self.adapter("restore", || infra.restore(target, key, spec)).await {
                    Ok(instance) => return Ok((instance, Some(snapshot.instance_key.clone()))),
                    Err(OrchestratorError::Infrastructure(InfraError::SourceNotFound(msg))) => {
                        error!(
                            snapshot_id = %snapshot.id,
                            "Snapshot image is gone, recovering from the origin image: {}",
                            msg
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            None => debug!("No snapshot stored, creating from the origin image"),
        }

        let instance = self.adapter("create", || infra.create(target, spec)).await?;
        Ok((instance, None))
    }

    async fn capture(&self, machine: &Machine, deadline: Duration) -> Result<Snapshot> {
        let infra = &self.inner.infra;
        let instance = machine.instance_ref();

        let work = async {
            let key = self.adapter("snapshot", || infra.snapshot(instance)).await?;
            match self
                .inner
                .snapshots
                .save(&machine.workspace_id, &machine.id, infra.name(), &key)
                .await
            {
                Ok(snapshot) => Ok(snapshot),
                Err(e) => {
                    if let Err(cleanup) = infra.remove_snapshot(&key).await {
                        warn!(snapshot = %key, "Failed to drop unrecorded snapshot: {}", cleanup);
                    }
                    Err(e)
                }
            }
        };

        timeout(deadline, work)
            .await
            .map_err(|_| OrchestratorError::Timeout {
                machine_id: machine.id.clone(),
                phase: "snapshotting",
            })?
    }

    /// Best-effort removal after a deadline left the instance half built.
    async fn discard_instance(&self, tx: &Transition<'_>) {
        let machine = tx.machine();
        let instance = machine.instance_ref();

        match timeout(self.inner.config.stop_timeout, self.inner.infra.remove(instance)).await {
            Ok(Ok(())) => debug!(instance, "Discarded instance"),
            Ok(Err(e)) => warn!(instance, "Failed to discard instance: {}", e),
            Err(_) => warn!(instance, "Timed out discarding instance"),
        }
    }

    async fn fail(&self, tx: &Transition<'_>, op: Option<String>, e: OrchestratorError) -> OrchestratorError {
        let message = e.to_string();
        let machine = tx.update(|m| {
            m.state = MachineState::Failed;
            m.error = Some(message.clone());
        });
        error!(machine_id = %machine.id, kind = e.kind(), "Machine failed: {}", message);
        self.publish(&machine);
        self.inner.operations.finish(op, Some(&message)).await;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;
    use wsm_provider::mock::{MockInfrastructure, MockOp};

    async fn setup() -> (Arc<MockInfrastructure>, MachineOrchestrator) {
        let mock = Arc::new(MockInfrastructure::new());
        let pool = create_test_db().await;
        let orchestrator = MachineOrchestrator::new(mock.clone(), pool, OrchestratorConfig::default());
        (mock, orchestrator)
    }

    #[tokio::test]
    async fn start_registers_running_machine() {
        let (mock, orchestrator) = setup().await;
        let machine = orchestrator
            .start_machine(StartMachineRequest::new("w1", MachineSpec::new("img")))
            .await
            .unwrap();

        assert_eq!(machine.state, MachineState::Running);
        assert!(mock.is_running(machine.instance_ref()));
        assert_eq!(orchestrator.machine_for_workspace("w1").unwrap().id, machine.id);
    }

    #[tokio::test]
    async fn empty_workspace_is_rejected() {
        let (_, orchestrator) = setup().await;
        let err = orchestrator
            .start_machine(StartMachineRequest::new(" ", MachineSpec::new("img")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(orchestrator.list_machines(&MachineFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn create_failure_marks_machine_failed() {
        let (mock, orchestrator) = setup().await;
        mock.fail_next(MockOp::Create, InfraError::Unauthorized("denied".into()));

        let err = orchestrator
            .start_machine(StartMachineRequest::new("w1", MachineSpec::new("img")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");

        let machines = orchestrator.list_machines(&MachineFilter::default());
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].state, MachineState::Failed);
        assert!(machines[0].error.as_deref().unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn abnormal_stop_only_applies_to_running_machines() {
        let (_, orchestrator) = setup().await;
        let machine = orchestrator
            .start_machine(StartMachineRequest::new("w1", MachineSpec::new("img")))
            .await
            .unwrap();

        let crashed = orchestrator.on_abnormal_stop(&machine.id, "exit 137").await.unwrap();
        assert_eq!(crashed.state, MachineState::Crashed);
        assert_eq!(crashed.error.as_deref(), Some("exit 137"));

        let err = orchestrator
            .on_abnormal_stop(&machine.id, "again")
            .await
            .unwrap_err();
        assert!(err.is_stale_state());
    }

    #[tokio::test]
    async fn restart_brings_crashed_machine_back() {
        let (mock, orchestrator) = setup().await;
        let machine = orchestrator
            .start_machine(StartMachineRequest::new("w1", MachineSpec::new("img")))
            .await
            .unwrap();
        orchestrator.on_abnormal_stop(&machine.id, "died").await.unwrap();

        let restarted = orchestrator.restart_machine(&machine.id).await.unwrap();
        assert_eq!(restarted.state, MachineState::Running);
        assert!(restarted.error.is_none());
        assert_eq!(mock.calls(MockOp::Start), 2);
    }

    #[tokio::test]
    async fn remove_requires_a_stopped_machine() {
        let (_, orchestrator) = setup().await;
        let machine = orchestrator
            .start_machine(StartMachineRequest::new("w1", MachineSpec::new("img")))
            .await
            .unwrap();

        assert!(orchestrator.remove_machine(&machine.id).await.unwrap_err().is_stale_state());

        orchestrator
            .stop_machine(&machine.id, StopOptions::default())
            .await
            .unwrap();
        orchestrator.remove_machine(&machine.id).await.unwrap();
        assert!(matches!(
            orchestrator.get_machine(&machine.id),
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn events_follow_transitions() {
        let (_, orchestrator) = setup().await;
        let mut events = orchestrator.subscribe();

        let machine = orchestrator
            .start_machine(StartMachineRequest::new("w1", MachineSpec::new("img")))
            .await
            .unwrap();
        orchestrator
            .stop_machine(&machine.id, StopOptions::default())
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![
                MachineState::Creating,
                MachineState::Running,
                MachineState::Stopping,
                MachineState::Stopped,
            ]
        );
    }
}
