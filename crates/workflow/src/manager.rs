//! Workflow lifecycle: create, execute, inspect, stop, clean up.
//!
//! Admission is a [`Semaphore`] with `max_concurrent` permits taken with
//! `try_acquire_owned`, so the concurrency ceiling holds under any
//! interleaving and excess executions fail fast with
//! [`WorkflowError::CapacityExceeded`]. Each run owns a cancellation token;
//! stopping the run (or hitting the execution timeout) fires it, and the
//! backend returns promptly, which unblocks [`WorkflowManager::execute_workflow`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use studio_core::backend::{BackendError, ExecutionOutput, ExecutionRequest, GenerationBackend};
use studio_core::graph::WorkflowGraph;
use studio_core::run::WorkflowRun;
use studio_core::task::TaskType;
use studio_core::types::WorkflowId;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::builder::build_workflow;
use crate::error::WorkflowError;
use crate::registry::RunRegistry;
use crate::templates::TemplateStore;

/// Directories and limits for the workflow manager.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Where generated workflow documents are written.
    pub workflows_dir: PathBuf,
    pub templates_dir: PathBuf,
    /// Where backends save downloaded outputs.
    pub output_dir: PathBuf,
    /// Maximum number of runs executing at once (default: `5`).
    pub max_concurrent: usize,
    /// Per-run execution limit (default: 300 s). Zero disables it.
    pub execution_timeout: Duration,
    /// Age after which finished runs and their files are cleaned up
    /// (default: 24 h).
    pub retention: Duration,
    /// How long a backend may take to return after its run is stopped or
    /// times out before the execution is abandoned (default: 5 s).
    pub cancel_grace: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workflows_dir: PathBuf::from("workflows"),
            templates_dir: PathBuf::from("templates"),
            output_dir: PathBuf::from("output"),
            max_concurrent: 5,
            execution_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 60 * 60),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// What one [`WorkflowManager::cleanup_old_workflows`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub runs_forgotten: usize,
    pub workflow_files_removed: usize,
    pub output_files_removed: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct WorkflowManager {
    config: WorkflowConfig,
    backend: Arc<dyn GenerationBackend>,
    templates: TemplateStore,
    registry: RunRegistry,
    slots: Arc<Semaphore>,
}

/// How the backend call ended, as seen by the manager.
enum Finish {
    Output(ExecutionOutput),
    Error(BackendError),
    TimedOut,
}

impl WorkflowManager {
    /// Create the configured directories and load templates.
    pub async fn new(
        config: WorkflowConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, WorkflowError> {
        tokio::fs::create_dir_all(&config.workflows_dir).await?;
        tokio::fs::create_dir_all(&config.output_dir).await?;
        let templates = TemplateStore::load(&config.templates_dir).await?;

        tracing::info!(
            backend = backend.name(),
            max_concurrent = config.max_concurrent,
            timeout_secs = config.execution_timeout.as_secs(),
            "Workflow manager ready",
        );

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            backend,
            templates,
            registry: RunRegistry::new(),
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Runs currently holding an execution slot.
    pub fn running_count(&self) -> usize {
        self.config.max_concurrent - self.slots.available_permits()
    }

    /// Build a workflow document for `task_type`, write it to
    /// `<workflows_dir>/<id>.json`, and register a pending run.
    pub async fn create_workflow(
        &self,
        task_type: &str,
        parameters: serde_json::Value,
    ) -> Result<WorkflowRun, WorkflowError> {
        let task_type: TaskType = task_type
            .parse()
            .map_err(|_| WorkflowError::UnknownTaskType(task_type.to_string()))?;

        let template_name = task_type.template_name();
        let template = self.templates.get(template_name).await.ok_or(
            WorkflowError::TemplateNotFound {
                task_type,
                template: template_name,
            },
        )?;

        let workflow = build_workflow(&template, &parameters);

        let id = uuid::Uuid::new_v4();
        let path = self.config.workflows_dir.join(format!("{id}.json"));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&workflow)?).await?;

        let run = WorkflowRun::new(id, path, task_type, parameters);
        self.registry.insert(run.clone()).await;

        tracing::info!(
            workflow_id = %id,
            task_type = %task_type,
            template = template_name,
            nodes = workflow.node_ids().count(),
            "Workflow created",
        );
        Ok(run)
    }

    /// Execute a pending run and wait for it to finish.
    ///
    /// Returns the final record: `completed`, `failed`, or `stopped` if
    /// [`stop_workflow`](Self::stop_workflow) was called meanwhile.
    pub async fn execute_workflow(&self, id: WorkflowId) -> Result<WorkflowRun, WorkflowError> {
        let _permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| WorkflowError::CapacityExceeded {
                limit: self.config.max_concurrent,
            })?;

        let (cancel, path) = self.registry.start(id).await?;
        tracing::info!(workflow_id = %id, backend = self.backend.name(), "Workflow execution started");

        match read_document(&path).await {
            Ok(workflow) => {
                let finish = self.run_backend(id, workflow, cancel).await;
                self.record(id, finish).await;
            }
            Err(e) => {
                tracing::error!(workflow_id = %id, error = %e, "Failed to read workflow document");
                self.registry.update(id, |run| run.fail(e.to_string())).await;
            }
        }

        self.get_workflow_status(id).await
    }

    pub async fn get_workflow_status(&self, id: WorkflowId) -> Result<WorkflowRun, WorkflowError> {
        self.registry.get(id).await.ok_or(WorkflowError::NotFound(id))
    }

    /// Stop a run. Returns `false` when it had already finished, which is
    /// not an error.
    pub async fn stop_workflow(&self, id: WorkflowId) -> Result<bool, WorkflowError> {
        let stopped = self
            .registry
            .stop(id)
            .await
            .ok_or(WorkflowError::NotFound(id))?;
        if stopped {
            tracing::info!(workflow_id = %id, "Workflow stopped");
        } else {
            tracing::debug!(workflow_id = %id, "Stop requested for finished workflow");
        }
        Ok(stopped)
    }

    /// Stop every run that has not finished. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let stopped = self.registry.stop_all().await;
        if stopped > 0 {
            tracing::info!(stopped, "Stopped all active workflows");
        }
        stopped
    }

    /// Every known run, oldest first.
    pub async fn list_workflows(&self) -> Vec<WorkflowRun> {
        self.registry.list().await
    }

    /// Forget finished runs and delete workflow documents and output files
    /// older than `max_age`. Documents of unfinished runs are kept.
    pub async fn cleanup_old_workflows(
        &self,
        max_age: Duration,
    ) -> Result<CleanupReport, WorkflowError> {
        let mut report = CleanupReport::default();

        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| chrono::Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            report.runs_forgotten = self.registry.remove_finished_before(cutoff).await.len();
        }

        let Some(file_cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(report);
        };
        let keep = self.registry.active_paths().await;
        report.workflow_files_removed = remove_files_older_than(
            &self.config.workflows_dir,
            file_cutoff,
            |path| path.extension().and_then(|e| e.to_str()) == Some("json") && !keep.contains(path),
        )
        .await?;
        report.output_files_removed =
            remove_files_older_than(&self.config.output_dir, file_cutoff, |_| true).await?;

        if report.is_empty() {
            tracing::debug!("Workflow cleanup: nothing to remove");
        } else {
            tracing::info!(
                runs = report.runs_forgotten,
                workflow_files = report.workflow_files_removed,
                output_files = report.output_files_removed,
                "Workflow cleanup: removed old entries",
            );
        }
        Ok(report)
    }

    // ---- private helpers ----

    /// Drive the backend call, copying progress and the prompt ID into the
    /// record and enforcing the execution timeout.
    ///
    /// Once the run's token fires, the backend gets `cancel_grace` to
    /// return; after that the execution future is dropped.
    async fn run_backend(
        &self,
        id: WorkflowId,
        workflow: WorkflowGraph,
        cancel: CancellationToken,
    ) -> Finish {
        let (progress_tx, mut progress_rx) = watch::channel(0u8);
        let (prompt_tx, mut prompt_rx) = watch::channel(None::<String>);
        let request = ExecutionRequest {
            run_id: id,
            workflow,
            output_dir: self.config.output_dir.clone(),
            cancel: cancel.clone(),
            progress: progress_tx,
            prompt_id: prompt_tx,
        };

        let execution = self.backend.execute(request);
        tokio::pin!(execution);

        let timeout = self.config.execution_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        let grace = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(grace);
        let mut cancelling = false;

        let finish = loop {
            tokio::select! {
                result = &mut execution => {
                    break match result {
                        Err(BackendError::Cancelled) if timed_out => Finish::TimedOut,
                        Ok(output) => Finish::Output(output),
                        Err(e) => Finish::Error(e),
                    };
                }
                Ok(()) = progress_rx.changed() => {
                    let percent = *progress_rx.borrow_and_update();
                    self.registry.update(id, |run| run.set_progress(percent)).await;
                }
                Ok(()) = prompt_rx.changed() => {
                    let submitted = prompt_rx.borrow_and_update().clone();
                    if let Some(prompt_id) = submitted {
                        tracing::debug!(workflow_id = %id, prompt_id = %prompt_id, "Workflow accepted by backend");
                        self.registry.update(id, |run| run.set_prompt_id(prompt_id)).await;
                    }
                }
                _ = &mut deadline, if !timeout.is_zero() && !timed_out => {
                    tracing::warn!(workflow_id = %id, timeout_secs = timeout.as_secs(), "Workflow execution timed out");
                    timed_out = true;
                    cancel.cancel();
                }
                _ = cancel.cancelled(), if !cancelling => {
                    cancelling = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + self.config.cancel_grace);
                }
                _ = &mut grace, if cancelling => {
                    tracing::warn!(
                        workflow_id = %id,
                        grace_secs = self.config.cancel_grace.as_secs_f64(),
                        "Backend did not honour cancellation, abandoning execution",
                    );
                    break if timed_out {
                        Finish::TimedOut
                    } else {
                        Finish::Error(BackendError::Cancelled)
                    };
                }
            }
        };

        let submitted = prompt_rx.borrow().clone();
        if let Some(prompt_id) = submitted {
            self.registry.update(id, |run| run.set_prompt_id(prompt_id)).await;
        }
        finish
    }

    /// Copy the outcome into the run record. A run that was stopped while
    /// executing stays stopped.
    async fn record(&self, id: WorkflowId, finish: Finish) {
        match finish {
            Finish::Output(output) => {
                let prompt_id = output.prompt_id.clone();
                let files = output.files.len();
                let applied = self.registry.update(id, |run| run.complete(output)).await;
                if applied == Some(true) {
                    tracing::info!(workflow_id = %id, prompt_id = %prompt_id, files, "Workflow completed");
                } else {
                    tracing::info!(workflow_id = %id, "Discarding result of stopped workflow");
                }
            }
            Finish::TimedOut => {
                let message = format!(
                    "Execution timed out after {}s",
                    self.config.execution_timeout.as_secs()
                );
                self.registry.update(id, |run| run.fail(message)).await;
            }
            Finish::Error(BackendError::Cancelled) => {
                tracing::info!(workflow_id = %id, "Workflow execution cancelled");
                self.registry.update(id, |run| run.stop()).await;
            }
            Finish::Error(e) => {
                tracing::error!(workflow_id = %id, error = %e, "Workflow failed");
                self.registry.update(id, |run| run.fail(e.to_string())).await;
            }
        }
    }
}

async fn read_document(path: &Path) -> Result<WorkflowGraph, WorkflowError> {
    let bytes = tokio::fs::read(path).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    WorkflowGraph::from_value(value).map_err(|e| WorkflowError::InvalidDocument(e.to_string()))
}

/// Delete regular files in `dir` last modified before `cutoff` and accepted
/// by `filter`. A missing directory counts as empty.
async fn remove_files_older_than(
    dir: &Path,
    cutoff: SystemTime,
    filter: impl Fn(&Path) -> bool,
) -> Result<usize, WorkflowError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = entry.metadata().await?;
        if !metadata.is_file() || !filter(&path) {
            continue;
        }
        let modified = metadata.modified()?;
        if modified >= cutoff {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove old file"),
        }
    }
    Ok(removed)
}
