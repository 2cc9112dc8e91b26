//! The seam between run bookkeeping and the server that executes workflows.
//!
//! [`GenerationBackend`] is implemented by the ComfyUI manager in
//! production and by in-memory fakes in tests.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::graph::WorkflowGraph;
use crate::types::WorkflowId;

/// Everything a backend needs to execute one run.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub run_id: WorkflowId,
    pub workflow: WorkflowGraph,
    /// Directory that downloaded output files are written to.
    pub output_dir: PathBuf,
    /// Triggered when the run is stopped or times out. Backends must return
    /// promptly (with [`BackendError::Cancelled`]) once it fires.
    pub cancel: CancellationToken,
    /// Completion percentage (0-100), updated as the server reports progress.
    pub progress: watch::Sender<u8>,
    /// Server-side prompt ID, sent as soon as the server accepts the
    /// workflow.
    pub prompt_id: watch::Sender<Option<String>>,
}

/// Result of a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Server-side identifier of the executed prompt.
    pub prompt_id: String,
    /// Raw per-node outputs, keyed by node ID.
    pub outputs: serde_json::Value,
    /// Files saved locally from the outputs.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The server could not be reached or is not running.
    #[error("Generation server unavailable: {0}")]
    Unavailable(String),

    /// The server refused the workflow (validation error, bad node, ...).
    #[error("Workflow rejected by server: {0}")]
    Rejected(String),

    /// The server reported an error while executing the workflow.
    #[error("Execution failed: {message}")]
    Execution {
        node_id: Option<String>,
        message: String,
    },

    /// The server interrupted execution without a request from us.
    #[error("Execution interrupted on the server")]
    Interrupted,

    /// The request's cancellation token fired.
    #[error("Execution cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can execute workflow documents.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Execute one workflow, resolving when the server reports completion,
    /// failure, or the request is cancelled.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, BackendError>;
}
