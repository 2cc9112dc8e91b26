//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, queue inspection and cancellation,
//! interruption, history retrieval, output download and the readiness
//! check using [`reqwest`].

use serde::Deserialize;
use serde_json::Value;

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Identifier of the queued prompt. Echoes the requested one when the
    /// server honours client-chosen IDs.
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    #[serde(default)]
    pub node_errors: Value,
}

/// Prompt IDs currently running and waiting, from `GET /queue`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    /// Parse the `{"queue_running": [...], "queue_pending": [...]}` body.
    ///
    /// Each queue entry is an array whose second element is the prompt ID.
    pub fn from_json(body: &Value) -> Self {
        let ids = |key: &str| -> Vec<String> {
            body.get(key)
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|e| e.get(1).and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            running: ids("queue_running"),
            pending: ids("queue_pending"),
        }
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.running.iter().any(|id| id == prompt_id)
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        self.pending.iter().any(|id| id == prompt_id)
    }
}

/// A file produced by an output node (`images`, `gifs`, ...).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// What `GET /history/{prompt_id}` says about one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    /// The server has no finished entry for the prompt yet.
    Unknown,
    /// Finished successfully with the given per-node outputs.
    Success { outputs: Value },
    /// Finished with an error.
    Error { message: String },
}

impl HistoryStatus {
    /// Interpret a history response body for `prompt_id`.
    ///
    /// The body maps prompt IDs to entries carrying `outputs` and a
    /// `status` object (`status_str`, `completed`, `messages`). Error
    /// details are taken from the `execution_error` message when present.
    pub fn from_json(body: &Value, prompt_id: &str) -> Self {
        let Some(entry) = body.get(prompt_id) else {
            return HistoryStatus::Unknown;
        };
        let status = entry.get("status");
        let status_str = status
            .and_then(|s| s.get("status_str"))
            .and_then(Value::as_str);
        let completed = status
            .and_then(|s| s.get("completed"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if status_str == Some("error") {
            let message = status
                .and_then(|s| s.get("messages"))
                .and_then(Value::as_array)
                .and_then(|msgs| {
                    msgs.iter().find_map(|m| {
                        (m.get(0).and_then(Value::as_str) == Some("execution_error"))
                            .then(|| m.get(1)?.get("exception_message")?.as_str())
                            .flatten()
                    })
                })
                .unwrap_or("execution failed")
                .to_string();
            return HistoryStatus::Error { message };
        }

        if completed || status_str == Some("success") {
            let outputs = entry
                .get("outputs")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            return HistoryStatus::Success { outputs };
        }

        HistoryStatus::Unknown
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApiError {
    /// Whether the server answered and refused the request (4xx), as opposed
    /// to being unreachable or failing internally.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ComfyUIApiError::ApiError { status, .. } if (400..500).contains(status))
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Readiness check: `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Submit a workflow for execution (`POST /prompt`).
    ///
    /// `prompt_id` asks the server to use a client-chosen ID so execution
    /// can be tracked before the response arrives. Servers that ignore it
    /// return their own ID in [`SubmitResponse::prompt_id`].
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
        prompt_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let mut body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        if let Some(id) = prompt_id {
            body["prompt_id"] = Value::String(id.to_string());
        }

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Remove a prompt that is still waiting in the queue (`POST /queue`).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Current queue contents (`GET /queue`).
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        let body: Value = Self::parse_response(response).await?;
        Ok(QueueSnapshot::from_json(&body))
    }

    /// Execution history for one prompt (`GET /history/{prompt_id}`).
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an output file (`GET /view`).
    pub async fn fetch_file(&self, file: &FileRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.folder_type.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}
