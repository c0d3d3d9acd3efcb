use crate::cluster::ClusterError;
use crate::workspace::WorkspaceState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: WorkspaceState,
        to: WorkspaceState,
    },

    #[error("Record {record} in {namespace} is malformed: {reason}")]
    MalformedRecord {
        namespace: String,
        record: &'static str,
        reason: String,
    },

    #[error("Gave up updating {record} in {namespace} after {attempts} conflicting writes")]
    ConflictRetriesExhausted {
        namespace: String,
        record: &'static str,
        attempts: u32,
    },

    #[error("Health check failed: {0}")]
    Health(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Transient failures are expected to clear on the next poll or scan.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Cluster(err) => err.is_transient(),
            OrchestratorError::ConflictRetriesExhausted { .. } | OrchestratorError::Health(_) => {
                true
            }
            _ => false,
        }
    }
}
