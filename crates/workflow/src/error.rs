use studio_core::task::TaskType;
use studio_core::types::WorkflowId;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Unknown task type: '{0}'")]
    UnknownTaskType(String),

    #[error("No template '{template}' for task type {task_type}")]
    TemplateNotFound {
        task_type: TaskType,
        template: &'static str,
    },

    #[error("Workflow {0} not found")]
    NotFound(WorkflowId),

    /// Every execution slot is taken.
    #[error("Concurrent workflow limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    /// A run executes at most once.
    #[error("Workflow {id} is already {status}")]
    AlreadyStarted {
        id: WorkflowId,
        status: &'static str,
    },

    #[error("Invalid workflow document: {0}")]
    InvalidDocument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
