use std::sync::Arc;
use wsm_orchestrator::{ActivityTracker, MachineOrchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: MachineOrchestrator,
    pub activity: Arc<ActivityTracker>,
}

impl AppState {
    pub fn new(orchestrator: MachineOrchestrator, activity: Arc<ActivityTracker>) -> Self {
        Self {
            orchestrator,
            activity,
        }
    }
}
