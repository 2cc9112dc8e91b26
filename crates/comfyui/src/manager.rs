//! ComfyUI server manager.
//!
//! [`ComfyUIManager`] optionally launches a local ComfyUI process, waits
//! for its HTTP API, and keeps one WebSocket connection open in a
//! background task (connect -> process -> reconnect -> reconcile). It
//! implements [`GenerationBackend`]: each execution registers a waiter with
//! the [`ExecutionTracker`], submits the workflow, and awaits the outcome
//! alongside the request's cancellation token.
//!
//! Events for our prompts are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`ComfyUIManager::subscribe`] to receive them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use studio_core::backend::{BackendError, ExecutionOutput, ExecutionRequest, GenerationBackend};
use studio_core::graph::WorkflowGraph;
use studio_core::types::WorkflowId;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, HistoryStatus};
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::events::ComfyUIEvent;
use crate::launcher::{wait_until_ready, LaunchConfig, LaunchError, ServerProcess};
use crate::outputs::{save_outputs, OutputError};
use crate::processor::{process_messages, StreamEnd};
use crate::reconnect::{reconnect_loop, ReconnectAborted, ReconnectConfig};
use crate::tracker::{ExecutionTracker, PromptOutcome};

/// Broadcast channel capacity for manager events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound for the queue delete and interrupt sent when an execution
/// is cancelled.
const STOP_PROMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long [`ComfyUIManager::shutdown`] waits for the listener task.
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the server lives and how to bring it up.
#[derive(Debug, Clone)]
pub struct ComfyUIConfig {
    pub host: String,
    pub port: u16,
    /// Launch a local server before connecting. `None` attaches to a
    /// server that is already running.
    pub launch: Option<LaunchConfig>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Limit for each HTTP request, downloads included.
    pub request_timeout: Duration,
    /// Grace period between SIGTERM and kill when stopping the server.
    pub shutdown_grace: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ComfyUIConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8188,
            launch: None,
            startup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ComfyUIConfig {
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Manages the connection to a single ComfyUI server.
///
/// Created once at startup via [`ComfyUIManager::start`]. The returned
/// `Arc` can be cloned into anything that needs a [`GenerationBackend`].
pub struct ComfyUIManager {
    config: ComfyUIConfig,
    api: Arc<ComfyUIApi>,
    client: Arc<ComfyUIClient>,
    tracker: Arc<ExecutionTracker>,
    event_tx: broadcast::Sender<ComfyUIEvent>,
    connected: Arc<AtomicBool>,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
    /// Cancelled when the listener exits for any reason. No prompt can be
    /// tracked after that.
    offline: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<ServerProcess>>,
}

/// Shared state handed to the background connection task.
struct Listener {
    client: Arc<ComfyUIClient>,
    api: Arc<ComfyUIApi>,
    tracker: Arc<ExecutionTracker>,
    event_tx: broadcast::Sender<ComfyUIEvent>,
    connected: Arc<AtomicBool>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    offline: CancellationToken,
}

impl ComfyUIManager {
    /// Launch (if configured), wait for readiness, connect the WebSocket,
    /// and start the listener task.
    ///
    /// A server launched here is stopped again if any later step fails.
    pub async fn start(config: ComfyUIConfig) -> Result<Arc<Self>, ComfyUIManagerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ComfyUIManagerError::HttpClient)?;
        let api = Arc::new(ComfyUIApi::with_client(http, config.api_url()));

        let mut process = match &config.launch {
            Some(launch) => Some(ServerProcess::spawn(launch, &config.host, config.port)?),
            None => None,
        };

        if let Err(e) = wait_until_ready(
            &api,
            config.startup_timeout,
            config.poll_interval,
            process.as_mut(),
        )
        .await
        {
            tracing::error!(error = %e, api_url = %config.api_url(), "ComfyUI did not become ready");
            if let Some(process) = process {
                process.shutdown(config.shutdown_grace).await;
            }
            return Err(e.into());
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let client = Arc::new(ComfyUIClient::new(config.ws_url(), client_id));
        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                if let Some(process) = process {
                    process.shutdown(config.shutdown_grace).await;
                }
                return Err(e.into());
            }
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            api,
            client,
            tracker: Arc::new(ExecutionTracker::new()),
            event_tx,
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            offline: CancellationToken::new(),
            listener: Mutex::new(None),
            process: Mutex::new(process),
            config,
        });

        let listener = Listener {
            client: Arc::clone(&manager.client),
            api: Arc::clone(&manager.api),
            tracker: Arc::clone(&manager.tracker),
            event_tx: manager.event_tx.clone(),
            connected: Arc::clone(&manager.connected),
            reconnect: manager.config.reconnect.clone(),
            cancel: manager.cancel.child_token(),
            offline: manager.offline.clone(),
        };
        manager.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            tracing::info!(client_id = %listener.client.client_id(), "Starting ComfyUI listener");
            let offline = listener.offline.clone();
            listener.run(conn).await;
            offline.cancel();
            tracing::info!("ComfyUI listener exited");
        });
        *manager.listener.lock().await = Some(handle);

        Ok(manager)
    }

    /// Subscribe to events for prompts submitted through this manager.
    pub fn subscribe(&self) -> broadcast::Receiver<ComfyUIEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether new executions are accepted: not shut down, and the listener
    /// has not given up reconnecting.
    pub fn is_available(&self) -> bool {
        !self.cancel.is_cancelled() && !self.offline.is_cancelled()
    }

    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Prompt IDs still waiting for a terminal message.
    pub fn pending_prompts(&self) -> Vec<String> {
        self.tracker.tracked()
    }

    /// Remove a prompt from the server queue and interrupt it if it is the
    /// one currently executing.
    pub async fn stop_prompt(&self, prompt_id: &str) -> Result<(), ComfyUIManagerError> {
        stop_on_server(&self.api, prompt_id).await
    }

    /// Stop the listener, release pending waiters, and stop the server if
    /// this manager launched it.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down ComfyUI manager");
        self.cancel.cancel();
        self.offline.cancel();

        if let Some(handle) = self.listener.lock().await.take() {
            if tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, handle)
                .await
                .is_err()
            {
                tracing::warn!("ComfyUI listener did not stop in time");
            }
        }
        self.connected.store(false, Ordering::SeqCst);

        let dropped = self.tracker.clear();
        if dropped > 0 {
            tracing::warn!(dropped, "Released prompts still pending at shutdown");
        }

        if let Some(process) = self.process.lock().await.take() {
            process.shutdown(self.config.shutdown_grace).await;
        }

        tracing::info!("ComfyUI manager shut down complete");
    }
}

#[async_trait]
impl GenerationBackend for ComfyUIManager {
    fn name(&self) -> &str {
        "comfyui"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, BackendError> {
        let ExecutionRequest {
            run_id,
            workflow,
            output_dir,
            cancel,
            progress,
            prompt_id: submitted,
        } = request;

        if !self.is_available() {
            return Err(unavailable());
        }

        // Register before submitting so no message for the prompt is missed.
        let requested_id = uuid::Uuid::new_v4().to_string();
        let done = self.tracker.register(&requested_id, Some(progress));
        // The listener may have exited between the check and registering.
        if !self.is_available() {
            self.tracker.forget(&requested_id);
            return Err(unavailable());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let accepted = submitted.borrow().clone();
                let prompt_id = accepted.unwrap_or_else(|| requested_id.clone());
                self.tracker.forget(&prompt_id);
                tracing::info!(%run_id, prompt_id = %prompt_id, "Execution cancelled, stopping prompt on server");
                self.stop_in_background(prompt_id);
                Err(BackendError::Cancelled)
            }
            result = self.run_prompt(
                run_id,
                &workflow,
                &output_dir,
                &requested_id,
                done,
                &submitted,
            ) => result,
        }
    }
}

impl ComfyUIManager {
    /// Submit, wait for the outcome, and download outputs. Raced against
    /// the request's cancellation token by `execute`.
    async fn run_prompt(
        &self,
        run_id: WorkflowId,
        workflow: &WorkflowGraph,
        output_dir: &Path,
        requested_id: &str,
        done: oneshot::Receiver<PromptOutcome>,
        submitted: &watch::Sender<Option<String>>,
    ) -> Result<ExecutionOutput, BackendError> {
        let response = match self
            .api
            .submit_workflow(
                &workflow.submittable(),
                self.client.client_id(),
                Some(requested_id),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.tracker.forget(requested_id);
                tracing::error!(%run_id, error = %e, "Workflow submission failed");
                return Err(if e.is_rejection() {
                    BackendError::Rejected(e.to_string())
                } else {
                    BackendError::Unavailable(e.to_string())
                });
            }
        };

        let prompt_id = response.prompt_id;
        submitted.send_replace(Some(prompt_id.clone()));
        if prompt_id != requested_id {
            tracing::debug!(
                requested = %requested_id,
                assigned = %prompt_id,
                "Server assigned its own prompt ID",
            );
            self.tracker.rekey(requested_id, &prompt_id);
            reconcile_prompt(&self.api, &self.tracker, &prompt_id).await;
        }

        tracing::info!(
            %run_id,
            prompt_id = %prompt_id,
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );

        match done.await {
            Ok(PromptOutcome::Completed { outputs }) => {
                let files = save_outputs(&self.api, &outputs, output_dir, &run_id.to_string())
                    .await
                    .map_err(|e| match e {
                        OutputError::Io(io) => BackendError::Io(io),
                        other => BackendError::Unavailable(other.to_string()),
                    })?;
                tracing::info!(
                    %run_id,
                    prompt_id = %prompt_id,
                    files = files.len(),
                    "Prompt completed",
                );
                Ok(ExecutionOutput {
                    prompt_id,
                    outputs,
                    files,
                })
            }
            Ok(PromptOutcome::Failed { node_id, message }) => {
                Err(BackendError::Execution { node_id, message })
            }
            Ok(PromptOutcome::Interrupted) => Err(BackendError::Interrupted),
            Err(_) => Err(BackendError::Unavailable(
                "Connection to ComfyUI was lost before the prompt finished".to_string(),
            )),
        }
    }

    /// Delete and interrupt `prompt_id` without holding up the caller.
    fn stop_in_background(&self, prompt_id: String) {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            match tokio::time::timeout(STOP_PROMPT_TIMEOUT, stop_on_server(&api, &prompt_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to stop prompt on server");
                }
                Err(_) => {
                    tracing::warn!(prompt_id = %prompt_id, "Timed out stopping prompt on server");
                }
            }
        });
    }
}

impl Listener {
    /// Core connection loop: process messages -> reconnect -> reconcile.
    ///
    /// Runs until the cancellation token is triggered or reconnecting
    /// gives up.
    async fn run(self, mut conn: ComfyUIConnection) {
        loop {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.event_tx.send(ComfyUIEvent::Connected {
                client_id: conn.client_id.clone(),
            });

            let end = process_messages(
                &mut conn.ws_stream,
                &self.tracker,
                &self.event_tx,
                &self.cancel,
            )
            .await;

            self.connected.store(false, Ordering::SeqCst);
            let _ = self.event_tx.send(ComfyUIEvent::Disconnected {
                client_id: conn.client_id.clone(),
            });

            if end == StreamEnd::Cancelled || self.cancel.is_cancelled() {
                return;
            }

            tracing::warn!(
                pending = self.tracker.tracked().len(),
                "ComfyUI connection lost, entering reconnect loop",
            );
            match reconnect_loop(&self.client, &self.reconnect, &self.cancel).await {
                Ok(new_conn) => {
                    conn = new_conn;
                    let resolved = reconcile_pending(&self.api, &self.tracker).await;
                    if resolved > 0 {
                        tracing::info!(resolved, "Resolved prompts that finished while disconnected");
                    }
                }
                Err(ReconnectAborted::Cancelled) => return,
                Err(ReconnectAborted::GaveUp { attempts }) => {
                    // Refuse new work before failing what is pending.
                    self.offline.cancel();
                    let dropped = self.tracker.clear();
                    tracing::error!(attempts, dropped, "ComfyUI unreachable, failing pending prompts");
                    return;
                }
            }
        }
    }
}

// ---- private helpers ----

fn unavailable() -> BackendError {
    BackendError::Unavailable("ComfyUI manager is shut down or disconnected".to_string())
}

async fn stop_on_server(api: &ComfyUIApi, prompt_id: &str) -> Result<(), ComfyUIManagerError> {
    api.cancel_execution(prompt_id)
        .await
        .map_err(|e| ComfyUIManagerError::CancelFailed(e.to_string()))?;

    let queue = api
        .get_queue()
        .await
        .map_err(|e| ComfyUIManagerError::CancelFailed(e.to_string()))?;

    if queue.is_running(prompt_id) {
        api.interrupt()
            .await
            .map_err(|e| ComfyUIManagerError::CancelFailed(e.to_string()))?;
        tracing::info!(prompt_id, "Interrupted running prompt");
    } else {
        tracing::info!(prompt_id, "Removed prompt from queue");
    }
    Ok(())
}

/// Check the history of every tracked prompt. Returns how many resolved.
async fn reconcile_pending(api: &ComfyUIApi, tracker: &ExecutionTracker) -> usize {
    let mut resolved = 0;
    for prompt_id in tracker.tracked() {
        if reconcile_prompt(api, tracker, &prompt_id).await {
            resolved += 1;
        }
    }
    resolved
}

/// Resolve `prompt_id` from `GET /history` if the server already finished it.
async fn reconcile_prompt(api: &ComfyUIApi, tracker: &ExecutionTracker, prompt_id: &str) -> bool {
    let body = match api.get_history(prompt_id).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(prompt_id, error = %e, "Failed to fetch prompt history");
            return false;
        }
    };

    let outcome = match HistoryStatus::from_json(&body, prompt_id) {
        HistoryStatus::Unknown => return false,
        HistoryStatus::Success { outputs } => PromptOutcome::Completed { outputs },
        HistoryStatus::Error { message } => PromptOutcome::Failed {
            node_id: None,
            message,
        },
    };
    tracing::debug!(prompt_id, ?outcome, "Reconciled prompt from history");
    tracker.resolve(prompt_id, outcome)
}

/// Errors that can occur when starting or driving the manager.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIManagerError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// A queue delete or interrupt call failed.
    #[error("Failed to cancel execution: {0}")]
    CancelFailed(String),
}
