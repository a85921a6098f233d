use utoipa::OpenApi;
use wsm_orchestrator::{
    Machine, MachineState, Operation, OperationStatus, OperationType, Snapshot,
    StartMachineRequest, StopOptions,
};
use wsm_provider::{InstanceKey, MachineSpec};

use crate::error::ErrorBody;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::machines::list_machines,
        crate::routes::machines::start_machine,
        crate::routes::machines::get_machine,
        crate::routes::machines::remove_machine,
        crate::routes::machines::stop_machine,
        crate::routes::machines::snapshot_machine,
        crate::routes::machines::restart_machine,
        crate::routes::workspaces::workspace_machine,
        crate::routes::workspaces::list_snapshots,
        crate::routes::workspaces::record_activity,
        crate::routes::snapshots::delete_snapshot,
        crate::routes::operations::list_operations,
        crate::routes::operations::get_operation,
    ),
    components(
        schemas(
            Machine,
            MachineState,
            MachineSpec,
            InstanceKey,
            StartMachineRequest,
            StopOptions,
            Snapshot,
            Operation,
            OperationStatus,
            OperationType,
            ErrorBody
        )
    ),
    tags(
        (name = "wsm-api", description = "Workspace Machine Lifecycle API")
    )
)]
pub struct ApiDoc;
