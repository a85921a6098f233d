//! Adapter construction settings.

use serde::Deserialize;

/// Selects and parameterizes the infrastructure adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct InfrastructureConfig {
    /// Provider name: "docker", "podman" (or "mock" with `test-helpers`).
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Image repository that snapshots are committed into.
    #[serde(default = "default_snapshot_repository")]
    pub snapshot_repository: String,
}

fn default_provider() -> String {
    "docker".to_string()
}

fn default_snapshot_repository() -> String {
    "wsm-snapshots".to_string()
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            snapshot_repository: default_snapshot_repository(),
        }
    }
}

impl InfrastructureConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_snapshot_repository(mut self, repository: impl Into<String>) -> Self {
        self.snapshot_repository = repository.into();
        self
    }
}
