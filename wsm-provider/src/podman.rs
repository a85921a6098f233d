//! Podman infrastructure adapter.
//!
//! Podman's CLI is compatible with Docker's for every operation the
//! orchestrator needs, so this adapter reuses the Docker implementation and
//! only swaps the binary and the event dialect.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::InfrastructureConfig;
use crate::docker::{CliFlavor, DockerInfrastructure};
use crate::error::Result;
use crate::spec::{InstanceEvent, InstanceKey, InstanceTarget, MachineSpec, ProvisionedInstance};
use crate::Infrastructure;

#[derive(Debug, Clone)]
pub struct PodmanInfrastructure {
    inner: DockerInfrastructure,
}

impl PodmanInfrastructure {
    /// Create a new Podman adapter, checking that the CLI is installed.
    pub fn new(config: &InfrastructureConfig) -> Result<Self> {
        Ok(Self {
            inner: DockerInfrastructure::with_cli("podman", CliFlavor::Podman, config)?,
        })
    }
}

#[async_trait]
impl Infrastructure for PodmanInfrastructure {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn create(&self, target: &InstanceTarget, spec: &MachineSpec) -> Result<ProvisionedInstance> {
        self.inner.create(target, spec).await
    }

    async fn start(&self, instance: &str) -> Result<()> {
        self.inner.start(instance).await
    }

    async fn stop(&self, instance: &str) -> Result<()> {
        self.inner.stop(instance).await
    }

    async fn snapshot(&self, instance: &str) -> Result<InstanceKey> {
        self.inner.snapshot(instance).await
    }

    async fn restore(
        &self,
        target: &InstanceTarget,
        key: &InstanceKey,
        spec: &MachineSpec,
    ) -> Result<ProvisionedInstance> {
        self.inner.restore(target, key, spec).await
    }

    async fn remove(&self, instance: &str) -> Result<()> {
        self.inner.remove(instance).await
    }

    async fn remove_snapshot(&self, key: &InstanceKey) -> Result<()> {
        self.inner.remove_snapshot(key).await
    }

    async fn watch(&self, events: mpsc::Sender<InstanceEvent>) -> Result<()> {
        self.inner.watch(events).await
    }
}
