//! Container infrastructure abstraction library.
//!
//! This library provides a uniform interface over the container runtimes that
//! back workspace machines. It defines the [`Infrastructure`] capability trait,
//! the provider-neutral [`MachineSpec`] and [`InstanceKey`] types, and a factory
//! that picks an implementation at construction time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod config;
pub mod error;
pub mod retry;
pub mod spec;

#[cfg(feature = "docker")]
pub mod docker;
#[cfg(feature = "podman")]
pub mod podman;

// When the `test-helpers` feature is enabled, include the mock adapter.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use config::InfrastructureConfig;
pub use error::{InfraError, Result};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use spec::{
    InstanceEvent, InstanceEventKind, InstanceKey, InstanceTarget, MachineSpec, ProvisionedInstance,
    MACHINE_LABEL, WORKSPACE_LABEL,
};

/// The capability every container backend provides to the orchestrator.
///
/// Calls are synchronous from the caller's point of view; implementations may
/// poll the backend internally. `stop`, `remove` and `remove_snapshot` must
/// succeed silently when the target is already gone.
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Get the name of the provider (e.g., "docker", "podman").
    fn name(&self) -> &'static str;

    /// Provision a new, not yet started instance from `spec`.
    async fn create(&self, target: &InstanceTarget, spec: &MachineSpec) -> Result<ProvisionedInstance>;

    /// Start a provisioned instance.
    async fn start(&self, instance: &str) -> Result<()>;

    /// Stop a running instance without destroying it.
    async fn stop(&self, instance: &str) -> Result<()>;

    /// Persist the instance filesystem and return the key addressing it.
    async fn snapshot(&self, instance: &str) -> Result<InstanceKey>;

    /// Provision a new instance from a stored snapshot.
    ///
    /// Fails with [`InfraError::SourceNotFound`] when the snapshot is gone.
    async fn restore(
        &self,
        target: &InstanceTarget,
        key: &InstanceKey,
        spec: &MachineSpec,
    ) -> Result<ProvisionedInstance>;

    /// Destroy an instance and everything attached to it.
    async fn remove(&self, instance: &str) -> Result<()>;

    /// Delete a stored snapshot.
    async fn remove_snapshot(&self, key: &InstanceKey) -> Result<()>;

    /// Push instance events into `events` until the provider stream ends or
    /// the receiver is dropped.
    async fn watch(&self, events: mpsc::Sender<InstanceEvent>) -> Result<()>;
}

/// Creates an infrastructure adapter based on the configuration.
///
/// # Returns
/// A shared adapter or an error if the provider is unknown or unavailable.
pub fn get_infrastructure(config: &InfrastructureConfig) -> Result<Arc<dyn Infrastructure>> {
    let provider_name = config.provider.as_str();

    #[cfg(feature = "test-helpers")]
    if provider_name == "mock" {
        return Ok(Arc::new(mock::MockInfrastructure::new()));
    }

    match provider_name {
        #[cfg(feature = "docker")]
        "docker" => Ok(Arc::new(docker::DockerInfrastructure::new(config)?)),
        #[cfg(feature = "podman")]
        "podman" => Ok(Arc::new(podman::PodmanInfrastructure::new(config)?)),
        _ => Err(InfraError::Provider(format!(
            "Unknown provider: {provider_name}"
        ))),
    }
}
