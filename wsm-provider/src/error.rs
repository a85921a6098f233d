//! Error types for infrastructure adapter operations.
//!
//! Every adapter maps its native failures onto this taxonomy so the
//! orchestrator can decide what to retry without knowing which container
//! runtime sits underneath.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, InfraError>;

/// Errors reported by an infrastructure adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfraError {
    /// Provider-side failure that may succeed on retry (network, daemon restart).
    #[error("Transient infrastructure error: {0}")]
    Transient(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The referenced image or snapshot does not exist.
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl InfraError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable, machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "infrastructure",
            Self::Unauthorized(_) => "unauthorized",
            Self::SourceNotFound(_) => "source_not_found",
            Self::Provider(_) => "infrastructure",
        }
    }

    /// The provider message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Unauthorized(m) | Self::SourceNotFound(m) | Self::Provider(m) => {
                m
            }
        }
    }
}

impl From<std::io::Error> for InfraError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted => InfraError::Transient(err.to_string()),
            std::io::ErrorKind::PermissionDenied => InfraError::Unauthorized(err.to_string()),
            _ => InfraError::Provider(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(err: serde_json::Error) -> Self {
        InfraError::Provider(format!("Malformed provider output: {err}"))
    }
}
