// Orchestrator Error Types
use thiserror::Error;

use crate::budget::BudgetExceeded;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Cyclic dependency in task graph: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Action blocked by policy: {0}")]
    PolicyBlocked(String),

    #[error("{0}")]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error("Approval drift: {0}")]
    ApprovalDrift(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Task {task_id} exhausted its retries ({attempts} attempts)")]
    TaskRetriesExhausted { task_id: String, attempts: u32 },

    #[error("Path outside workspace: {0}")]
    OutOfScope(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Execution failed: {0}")]
    Execution(String),
}

impl OrchestratorError {
    /// Failures retried inside the scheduler rather than surfaced as a run status change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Generation(_)
                | Self::ValidationFailed(_)
                | Self::PolicyBlocked(_)
                | Self::Execution(_)
        )
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        OrchestratorError::InvalidConfig(err.to_string())
    }
}

// Errors cross IPC/HTTP boundaries as plain strings.
impl serde::Serialize for OrchestratorError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
