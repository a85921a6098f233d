use thiserror::Error;
use wsm_provider::InfraError;

use crate::machine::MachineState;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{0}")]
    Infrastructure(#[from] InfraError),

    /// The machine is no longer in a state the operation can start from.
    #[error("Machine {machine_id} is {actual}, expected {expected}")]
    StaleState {
        machine_id: String,
        expected: String,
        actual: MachineState,
    },

    #[error("Deadline exceeded while {phase} machine {machine_id}")]
    Timeout { machine_id: String, phase: &'static str },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub(crate) fn stale(machine_id: &str, expected: &str, actual: MachineState) -> Self {
        Self::StaleState {
            machine_id: machine_id.to_string(),
            expected: expected.to_string(),
            actual,
        }
    }

    /// Stable error class reported to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Infrastructure(e) => e.kind(),
            Self::StaleState { .. } => "stale_state",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Database(_)
            | Self::Migration(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Internal(_) => "internal",
        }
    }

    pub fn is_stale_state(&self) -> bool {
        matches!(self, Self::StaleState { .. })
    }
}
