//! Error taxonomy for pipeline execution.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::gate::GateVerdict;

/// Coarse failure class recorded in the diagnostic trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// External tool returned failure, non-zero, or timed out.
    Operation,
    /// Quality verdict was not acceptable (including TIMEOUT).
    Gate,
    /// A named credential could not be resolved.
    Credential,
    /// Operator cancellation.
    Abort,
}

/// Gantry errors.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    #[error("operation '{operation}' failed: {reason}")]
    OperationFailure { operation: String, reason: String },

    #[error("quality gate failed with verdict {verdict}")]
    GateFailure { verdict: GateVerdict },

    #[error("credential '{name}' could not be resolved: {reason}")]
    CredentialResolution { name: String, reason: String },

    #[error("credential '{name}' used outside of its scope")]
    CredentialRevoked { name: String },

    #[error("abort requested")]
    AbortRequested,

    #[error("tag {build_number} of '{artifact}' was already assigned by run {run_id}")]
    TagReused {
        artifact: String,
        build_number: u64,
        run_id: uuid::Uuid,
    },

    #[error("artifact '{0}' was not produced by any earlier operation")]
    ArtifactNotFound(String),

    #[error("no {0} configured for this pipeline")]
    MissingCollaborator(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GantryError {
    /// Map the error onto the failure class recorded for its operation.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GantryError::GateFailure { .. } => FailureKind::Gate,
            GantryError::CredentialResolution { .. } | GantryError::CredentialRevoked { .. } => {
                FailureKind::Credential
            }
            GantryError::AbortRequested => FailureKind::Abort,
            _ => FailureKind::Operation,
        }
    }
}

/// Result type for gantry operations.
pub type Result<T> = std::result::Result<T, GantryError>;
