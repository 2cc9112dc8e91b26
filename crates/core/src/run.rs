//! Workflow run records and their status transitions.
//!
//! A run starts as [`RunStatus::Pending`] when its workflow is created, moves
//! to [`RunStatus::Running`] once (and only once), and ends in one of the
//! terminal statuses. Terminal records are never modified again, so a late
//! result from the server cannot overwrite a stop.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::ExecutionOutput;
use crate::error::CoreError;
use crate::task::TaskType;
use crate::types::{Timestamp, WorkflowId};

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

/// In-memory record of one workflow, from creation to a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub id: WorkflowId,
    /// Where the workflow document was written.
    pub path: PathBuf,
    pub task_type: TaskType,
    /// Parameters the workflow was created with, verbatim.
    pub parameters: serde_json::Value,
    pub status: RunStatus,
    /// Server-side prompt ID, set once the server accepts the workflow.
    pub prompt_id: Option<String>,
    /// Completion percentage (0-100).
    pub progress: u8,
    pub output: Option<ExecutionOutput>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkflowRun {
    pub fn new(
        id: WorkflowId,
        path: PathBuf,
        task_type: TaskType,
        parameters: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            path,
            task_type,
            parameters,
            status: RunStatus::Pending,
            prompt_id: None,
            progress: 0,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move from `pending` to `running`.
    ///
    /// Any other starting status is a conflict: a run executes at most once.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != RunStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "Workflow {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = RunStatus::Running;
        self.touch();
        Ok(())
    }

    /// Record a successful result. Returns `false` if the run had already
    /// reached a terminal status.
    pub fn complete(&mut self, output: ExecutionOutput) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RunStatus::Completed;
        self.progress = 100;
        self.prompt_id = Some(output.prompt_id.clone());
        self.output = Some(output);
        self.touch();
        true
    }

    /// Record a failure. Returns `false` if the run had already reached a
    /// terminal status.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.touch();
        true
    }

    /// Mark the run stopped. Stopping a terminal run is a no-op and returns
    /// `false`.
    pub fn stop(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RunStatus::Stopped;
        self.touch();
        true
    }

    /// Record the server's prompt ID.
    ///
    /// Ignored while pending. A terminal run only accepts an ID if it has
    /// none yet, so a run stopped mid-submission still learns its prompt.
    pub fn set_prompt_id(&mut self, prompt_id: impl Into<String>) {
        let accepts = match self.status {
            RunStatus::Pending => false,
            RunStatus::Running => true,
            _ => self.prompt_id.is_none(),
        };
        if accepts {
            self.prompt_id = Some(prompt_id.into());
            self.touch();
        }
    }

    /// Update progress while running; ignored in any other status.
    pub fn set_progress(&mut self, percent: u8) {
        if self.status == RunStatus::Running {
            self.progress = percent.min(100);
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}
