use thiserror::Error;

use crate::policy::LimitKind;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph validation errors
    #[error("Unknown node reference in {location}: {node_id}")]
    UnknownNodeReference { location: String, node_id: String },

    #[error("Cycle detected among nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("No node runner registered for key '{key}' (node {node_id})")]
    UnknownRunner { key: String, node_id: String },

    // Tenant and policy errors
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Policy violation: {rule_id}: {message}")]
    PolicyViolation { rule_id: String, message: String },

    #[error("Budget exceeded ({limit}): {detail}")]
    BudgetExceeded { limit: LimitKind, detail: String },

    // Execution errors
    #[error("Operation cancelled")]
    OperationCancelled,

    #[error("Node execution failed: {node_id}: {message}")]
    NodeExecution { node_id: String, message: String },

    // Sink and storage errors
    #[error("Audit sink error: {sink}: {message}")]
    AuditSink { sink: String, message: String },

    #[error("Artifact write failed: {artifact_id}: {message}")]
    ArtifactWrite { artifact_id: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether this error comes from graph well-formedness checks.
    pub fn is_graph_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownNodeReference { .. }
                | Self::CycleDetected { .. }
                | Self::DuplicateNode(_)
                | Self::UnknownRunner { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
