//! In-memory adapter for tests.
//!
//! Counts every call that reaches it, can fail or delay scripted operations,
//! and lets tests push instance events into whoever is watching.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::{InfraError, Result};
use crate::spec::{InstanceEvent, InstanceKey, InstanceTarget, MachineSpec, ProvisionedInstance};
use crate::Infrastructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Start,
    Stop,
    Snapshot,
    Restore,
    Remove,
    RemoveSnapshot,
}

#[derive(Debug, Clone)]
pub struct MockInstance {
    pub name: String,
    pub instance_id: String,
    pub machine_id: String,
    pub image: String,
    pub running: bool,
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    images: HashSet<String>,
    calls: HashMap<MockOp, usize>,
    failures: HashMap<MockOp, VecDeque<InfraError>>,
    delays: HashMap<MockOp, Duration>,
    next_id: u64,
    watchers: Vec<mpsc::Sender<InstanceEvent>>,
}

impl MockState {
    fn lookup(&mut self, instance: &str) -> Option<&mut MockInstance> {
        self.instances
            .values_mut()
            .find(|i| i.name == instance || i.instance_id == instance)
    }
}

#[derive(Default)]
pub struct MockInfrastructure {
    state: Mutex<MockState>,
}

fn image_key(key: &InstanceKey) -> String {
    format!(
        "{}:{}",
        key.get("repository").unwrap_or_default(),
        key.get("tag").unwrap_or_default()
    )
}

impl MockInfrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next call of `op` fail with `err`. Calls queue up in order.
    pub fn fail_next(&self, op: MockOp, err: InfraError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    /// Make the next `times` calls of `op` fail with `err`.
    pub fn fail_times(&self, op: MockOp, err: InfraError, times: usize) {
        for _ in 0..times {
            self.fail_next(op, err.clone());
        }
    }

    /// Delay every call of `op` by `delay` before it does anything.
    pub fn set_delay(&self, op: MockOp, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    /// Number of calls of `op` that reached the adapter (failed ones included).
    pub fn calls(&self, op: MockOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn instance(&self, instance: &str) -> Option<MockInstance> {
        self.state().lookup(instance).cloned()
    }

    pub fn is_running(&self, instance: &str) -> bool {
        self.instance(instance).is_some_and(|i| i.running)
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    pub fn has_image(&self, key: &InstanceKey) -> bool {
        self.state().images.contains(&image_key(key))
    }

    /// Forget a stored snapshot so a later restore hits `SourceNotFound`.
    pub fn drop_image(&self, key: &InstanceKey) {
        self.state().images.remove(&image_key(key));
    }

    /// Push an event to every active watcher.
    pub async fn emit(&self, event: InstanceEvent) {
        let watchers = self.state().watchers.clone();
        for watcher in watchers {
            let _ = watcher.send(event.clone()).await;
        }
    }

    /// Simulate the container of `machine_id` dying with `exit_code`.
    pub async fn kill_machine(&self, machine_id: &str, exit_code: i64) {
        let instance_id = {
            let mut state = self.state();
            match state.instances.values_mut().find(|i| i.machine_id == machine_id) {
                Some(instance) => {
                    instance.running = false;
                    instance.instance_id.clone()
                }
                None => return,
            }
        };
        let event = InstanceEvent::died(machine_id, instance_id, Some(exit_code)).observed_at(Utc::now());
        self.emit(event).await;
    }

    async fn enter(&self, op: MockOp) -> Result<()> {
        let (delay, failure) = {
            let mut state = self.state();
            *state.calls.entry(op).or_default() += 1;
            let delay = state.delays.get(&op).copied();
            let failure = state.failures.get_mut(&op).and_then(|q| q.pop_front());
            (delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn provision(&self, target: &InstanceTarget, image: String) -> ProvisionedInstance {
        let mut state = self.state();
        state.next_id += 1;
        let instance_id = format!("mock-{:06}", state.next_id);
        state.instances.insert(
            target.name.clone(),
            MockInstance {
                name: target.name.clone(),
                instance_id: instance_id.clone(),
                machine_id: target.machine_id.clone(),
                image,
                running: false,
            },
        );
        ProvisionedInstance {
            name: target.name.clone(),
            instance_id,
        }
    }
}

#[async_trait]
impl Infrastructure for MockInfrastructure {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, target: &InstanceTarget, spec: &MachineSpec) -> Result<ProvisionedInstance> {
        self.enter(MockOp::Create).await?;
        Ok(self.provision(target, spec.image.clone()))
    }

    async fn start(&self, instance: &str) -> Result<()> {
        self.enter(MockOp::Start).await?;
        let mut state = self.state();
        let found = state
            .lookup(instance)
            .ok_or_else(|| InfraError::Provider(format!("No such container: {instance}")))?;
        found.running = true;
        Ok(())
    }

    async fn stop(&self, instance: &str) -> Result<()> {
        self.enter(MockOp::Stop).await?;
        if let Some(found) = self.state().lookup(instance) {
            found.running = false;
        }
        Ok(())
    }

    async fn snapshot(&self, instance: &str) -> Result<InstanceKey> {
        self.enter(MockOp::Snapshot).await?;
        let mut state = self.state();
        let name = state
            .lookup(instance)
            .map(|i| i.name.clone())
            .ok_or_else(|| InfraError::Provider(format!("No such container: {instance}")))?;
        state.next_id += 1;
        let key = InstanceKey::new([
            ("repository", format!("mock/{name}")),
            ("tag", format!("{:06}", state.next_id)),
            ("digest", format!("sha256:mock{:06}", state.next_id)),
        ]);
        state.images.insert(image_key(&key));
        Ok(key)
    }

    async fn restore(
        &self,
        target: &InstanceTarget,
        key: &InstanceKey,
        _spec: &MachineSpec,
    ) -> Result<ProvisionedInstance> {
        self.enter(MockOp::Restore).await?;
        let image = image_key(key);
        if !self.state().images.contains(&image) {
            return Err(InfraError::SourceNotFound(format!("No such image: {image}")));
        }
        Ok(self.provision(target, image))
    }

    async fn remove(&self, instance: &str) -> Result<()> {
        self.enter(MockOp::Remove).await?;
        self.state()
            .instances
            .retain(|_, i| i.name != instance && i.instance_id != instance);
        Ok(())
    }

    async fn remove_snapshot(&self, key: &InstanceKey) -> Result<()> {
        self.enter(MockOp::RemoveSnapshot).await?;
        self.state().images.remove(&image_key(key));
        Ok(())
    }

    async fn watch(&self, events: mpsc::Sender<InstanceEvent>) -> Result<()> {
        self.state().watchers.push(events.clone());
        events.closed().await;
        Ok(())
    }
}
