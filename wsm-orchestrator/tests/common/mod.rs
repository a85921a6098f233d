//! Shared setup for orchestrator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use wsm_orchestrator::db::connect_in_memory;
use wsm_orchestrator::{Machine, MachineOrchestrator, OrchestratorConfig, StartMachineRequest};
use wsm_provider::mock::MockInfrastructure;
use wsm_provider::{MachineSpec, RetryPolicy};

/// Retry quickly so transient-failure tests stay fast on the real clock.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
        ..OrchestratorConfig::default()
    }
}

pub async fn orchestrator_with(config: OrchestratorConfig) -> (Arc<MockInfrastructure>, MachineOrchestrator) {
    let mock = Arc::new(MockInfrastructure::new());
    let pool = connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let orchestrator = MachineOrchestrator::new(mock.clone(), pool, config);
    (mock, orchestrator)
}

pub async fn orchestrator() -> (Arc<MockInfrastructure>, MachineOrchestrator) {
    orchestrator_with(fast_config()).await
}

pub fn spec() -> MachineSpec {
    MachineSpec::new("eclipse/ubuntu_jdk8").with_memory_limit_mb(2048)
}

pub async fn running_machine(orchestrator: &MachineOrchestrator, workspace_id: &str) -> Machine {
    orchestrator
        .start_machine(StartMachineRequest::new(workspace_id, spec()))
        .await
        .expect("Failed to start machine")
}

/// Poll `condition` on the real clock for up to five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
