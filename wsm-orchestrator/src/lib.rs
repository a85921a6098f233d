//! Workspace machine lifecycle orchestration
//!
//! This crate owns the machines backing user workspaces: it starts, snapshots,
//! stops and removes them through a `wsm-provider` adapter, notices containers
//! that die on their own, and stops workspaces that went idle. It is consumed
//! by the wsm-api HTTP service but can be embedded by any tokio application.

pub mod activity;
pub mod db;
pub mod error;
pub mod machine;
pub mod monitor;
pub mod operation;
pub mod orchestrator;
mod registry;
pub mod snapshot;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use activity::{
    follow, spawn_sweeper, ActivityConfig, ActivityTracker, Expiry, ExpiryReason,
    IdleTimeoutHandler, WorkspaceActivityRecord,
};
pub use error::{OrchestratorError, Result};
pub use machine::{
    Machine, MachineEvent, MachineFilter, MachineSource, MachineState, StartMachineRequest,
    StopOptions,
};
pub use monitor::{
    AbnormalMachineStopHandler, AbnormalStopEvent, AbnormalStopMonitor, MonitorConfig,
    MonitorTasks,
};
pub use operation::{Operation, OperationFilter, OperationLog, OperationStatus, OperationType};
pub use orchestrator::{MachineOrchestrator, OrchestratorConfig};
pub use snapshot::{Snapshot, SnapshotStore};
