//! [`SystemManager`]: lifecycle of the ComfyUI connection and the workflow
//! manager, plus the request entry points.
//!
//! Requests that name (or imply) a generation task become workflow runs
//! executed in the background; the caller gets the run ID back immediately
//! and polls [`SystemManager::get_task_status`]. Anything else gets a plain
//! acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use studio_comfyui::manager::{ComfyUIManager, ComfyUIManagerError};
use studio_core::backend::GenerationBackend;
use studio_core::run::WorkflowRun;
use studio_core::task::TaskType;
use studio_core::types::WorkflowId;
use studio_workflow::error::WorkflowError;
use studio_workflow::manager::WorkflowManager;
use studio_workflow::retention;

use crate::classify::infer_task_type;
use crate::config::StudioConfig;

/// How long [`SystemManager::stop`] waits for background executions and the
/// retention job.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("System is not running")]
    NotRunning,

    #[error("System is already running")]
    AlreadyRunning,

    #[error(transparent)]
    ComfyUI(#[from] ComfyUIManagerError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Result of [`SystemManager::process_request`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// No generation task was identified.
    Reply { message: String },
    /// A workflow run was created and is executing in the background.
    TaskStarted {
        task_id: WorkflowId,
        task_type: TaskType,
    },
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    /// `None` when the system runs without a ComfyUI connection.
    pub comfyui_connected: Option<bool>,
    pub running_tasks: usize,
    pub known_tasks: usize,
}

struct Running {
    comfyui: Option<Arc<ComfyUIManager>>,
    workflows: Arc<WorkflowManager>,
    executions: TaskTracker,
    retention_cancel: CancellationToken,
    retention: JoinHandle<()>,
}

pub struct SystemManager {
    config: StudioConfig,
    state: RwLock<Option<Running>>,
}

impl SystemManager {
    pub fn new(config: StudioConfig) -> Self {
        Self {
            config,
            state: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    /// Connect to (or launch) ComfyUI and start the workflow manager.
    pub async fn start(&self) -> Result<(), SystemError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(SystemError::AlreadyRunning);
        }

        let comfyui = ComfyUIManager::start(self.config.comfyui.clone()).await?;
        let backend: Arc<dyn GenerationBackend> = comfyui.clone();

        match self.start_workflows(backend).await {
            Ok(running) => {
                *state = Some(Running {
                    comfyui: Some(comfyui),
                    ..running
                });
                Ok(())
            }
            Err(e) => {
                comfyui.shutdown().await;
                Err(e)
            }
        }
    }

    /// Start with an arbitrary generation backend instead of ComfyUI.
    pub async fn start_with_backend(
        &self,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<(), SystemError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(SystemError::AlreadyRunning);
        }
        *state = Some(self.start_workflows(backend).await?);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// The workflow manager, while running.
    pub async fn workflows(&self) -> Option<Arc<WorkflowManager>> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.workflows))
    }

    pub async fn status(&self) -> SystemStatus {
        let state = self.state.read().await;
        match state.as_ref() {
            None => SystemStatus {
                running: false,
                comfyui_connected: None,
                running_tasks: 0,
                known_tasks: 0,
            },
            Some(running) => SystemStatus {
                running: true,
                comfyui_connected: running.comfyui.as_ref().map(|c| c.is_connected()),
                running_tasks: running.workflows.running_count(),
                known_tasks: running.workflows.list_workflows().await.len(),
            },
        }
    }

    /// Handle a free-text request.
    ///
    /// With an explicit `task_type`, or one inferred from the message, a
    /// workflow is created with `{"message": message}` as its parameters
    /// and executed in the background. Otherwise the request is only
    /// acknowledged.
    pub async fn process_request(
        &self,
        message: &str,
        task_type: Option<TaskType>,
    ) -> Result<RequestOutcome, SystemError> {
        let state = self.state.read().await;
        let running = state.as_ref().ok_or(SystemError::NotRunning)?;

        let Some(task_type) = task_type.or_else(|| infer_task_type(message)) else {
            tracing::debug!(message_len = message.len(), "No task identified in request");
            return Ok(RequestOutcome::Reply {
                message: format!("System response to: {message}"),
            });
        };

        let workflows = &running.workflows;
        let limit = workflows.config().max_concurrent;
        if workflows.running_count() >= limit {
            return Err(WorkflowError::CapacityExceeded { limit }.into());
        }

        let run = workflows
            .create_workflow(task_type.as_str(), json!({ "message": message }))
            .await?;
        let id = run.id;

        let workflows = Arc::clone(workflows);
        running.executions.spawn(async move {
            match workflows.execute_workflow(id).await {
                Ok(run) => {
                    tracing::info!(task_id = %id, status = run.status.as_str(), "Task finished");
                }
                Err(WorkflowError::CapacityExceeded { limit }) => {
                    // Lost the race for a slot after the check above.
                    tracing::warn!(task_id = %id, limit, "No execution slot for task, stopping it");
                    if let Err(e) = workflows.stop_workflow(id).await {
                        tracing::warn!(task_id = %id, error = %e, "Failed to stop task without a slot");
                    }
                }
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "Task execution failed");
                }
            }
        });

        tracing::info!(task_id = %id, task_type = %task_type, "Task started");
        Ok(RequestOutcome::TaskStarted {
            task_id: id,
            task_type,
        })
    }

    pub async fn get_task_status(&self, id: WorkflowId) -> Result<WorkflowRun, SystemError> {
        let workflows = self.workflows().await.ok_or(SystemError::NotRunning)?;
        Ok(workflows.get_workflow_status(id).await?)
    }

    /// Stop one task. `false` when it had already finished.
    pub async fn stop_task(&self, id: WorkflowId) -> Result<bool, SystemError> {
        let workflows = self.workflows().await.ok_or(SystemError::NotRunning)?;
        Ok(workflows.stop_workflow(id).await?)
    }

    /// Every known task, oldest first.
    pub async fn list_tasks(&self) -> Result<Vec<WorkflowRun>, SystemError> {
        let workflows = self.workflows().await.ok_or(SystemError::NotRunning)?;
        Ok(workflows.list_workflows().await)
    }

    /// Stop every task, wait briefly for background executions, and
    /// disconnect from ComfyUI. Does nothing when not running.
    pub async fn stop(&self) {
        let Some(running) = self.state.write().await.take() else {
            return;
        };

        let stopped = running.workflows.stop_all().await;
        tracing::info!(stopped, "Stopping system");

        running.executions.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, running.executions.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = running.executions.len(),
                "Background executions did not finish in time"
            );
        }

        running.retention_cancel.cancel();
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, running.retention).await;

        if let Some(comfyui) = running.comfyui {
            comfyui.shutdown().await;
        }
        tracing::info!("System stopped");
    }

    // ---- private helpers ----

    async fn start_workflows(
        &self,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Running, SystemError> {
        let workflows = Arc::new(WorkflowManager::new(self.config.workflow.clone(), backend).await?);

        let retention_cancel = CancellationToken::new();
        let retention = tokio::spawn(retention::run(
            Arc::clone(&workflows),
            retention_cancel.clone(),
        ));

        tracing::info!(
            templates = workflows.templates().names().await.len(),
            "System started"
        );
        Ok(Running {
            comfyui: None,
            workflows,
            executions: TaskTracker::new(),
            retention_cancel,
            retention,
        })
    }
}
