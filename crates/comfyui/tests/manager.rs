//! End-to-end tests for `ComfyUIManager` against the in-process mock server.

mod common;

use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use common::{MockComfyUI, Script, FILE_BYTES};
use studio_comfyui::events::ComfyUIEvent;
use studio_comfyui::launcher::LaunchError;
use studio_comfyui::manager::{ComfyUIConfig, ComfyUIManager, ComfyUIManagerError};
use studio_core::backend::{BackendError, ExecutionRequest, GenerationBackend};
use studio_core::graph::WorkflowGraph;

fn workflow() -> WorkflowGraph {
    WorkflowGraph::from_value(json!({
        "prompt": "a lighthouse at dusk",
        "style": "oil painting",
        "3": {"class_type": "KSampler", "inputs": {"seed": 7}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}}
    }))
    .unwrap()
}

fn request(
    graph: WorkflowGraph,
    output_dir: &Path,
) -> (ExecutionRequest, watch::Receiver<u8>, CancellationToken) {
    let (progress, progress_rx) = watch::channel(0u8);
    let (prompt_id, _) = watch::channel(None);
    let cancel = CancellationToken::new();
    let request = ExecutionRequest {
        run_id: uuid::Uuid::new_v4(),
        workflow: graph,
        output_dir: output_dir.to_path_buf(),
        cancel: cancel.clone(),
        progress,
        prompt_id,
    };
    (request, progress_rx, cancel)
}

// ---------------------------------------------------------------------------
// Test: successful prompt resolves with outputs and downloaded files
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_completes_and_downloads_outputs() {
    let mock = MockComfyUI::start(Script::Succeed).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();
    assert!(manager.is_connected());

    let dir = tempfile::tempdir().unwrap();
    let (req, progress_rx, _cancel) = request(workflow(), dir.path());
    let run_id = req.run_id;

    let output = tokio::time::timeout(Duration::from_secs(5), manager.execute(req))
        .await
        .expect("execution timed out")
        .expect("execution failed");

    assert_eq!(
        output.outputs["9"]["images"][0]["filename"],
        json!("result.png")
    );
    assert_eq!(output.files.len(), 1);
    let saved = &output.files[0];
    assert_eq!(
        saved.file_name().unwrap().to_str().unwrap(),
        format!("{run_id}_9_result.png")
    );
    assert_eq!(std::fs::read(saved).unwrap(), FILE_BYTES);
    assert_eq!(*progress_rx.borrow(), 50);

    let recorded = mock.recorded();
    assert_eq!(recorded.submissions.len(), 1);
    let body = &recorded.submissions[0];
    assert_eq!(body["client_id"], json!(manager.client_id()));
    assert_eq!(body["prompt_id"], json!(output.prompt_id));
    // Only node descriptors are sent to the server.
    let prompt = body["prompt"].as_object().unwrap();
    assert_eq!(prompt.len(), 2);
    assert!(!prompt.contains_key("style"));

    assert!(manager.pending_prompts().is_empty());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: execution_error surfaces as a typed execution failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execution_error_maps_to_execution_failure() {
    let mock = MockComfyUI::start(Script::Fail).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, _cancel) = request(workflow(), dir.path());
    let result = tokio::time::timeout(Duration::from_secs(5), manager.execute(req))
        .await
        .expect("execution timed out");

    assert_matches!(
        result,
        Err(BackendError::Execution { node_id: Some(node), message })
            if node == "3" && message == "CUDA out of memory"
    );
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: the server rejecting a workflow is not an availability problem
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_workflow_maps_to_rejected() {
    let mock = MockComfyUI::start(Script::Succeed).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let empty = WorkflowGraph::from_value(json!({"prompt": "no nodes"})).unwrap();
    let (req, _progress, _cancel) = request(empty, dir.path());

    assert_matches!(manager.execute(req).await, Err(BackendError::Rejected(msg)) if msg.contains("400"));
    assert!(manager.pending_prompts().is_empty());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: cancelling deletes the prompt and interrupts it while running
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_deletes_and_interrupts_running_prompt() {
    let mock = MockComfyUI::start(Script::Hang).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, cancel) = request(workflow(), dir.path());
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(req).await })
    };

    let recorded = mock.wait_for_submissions(1).await;
    let prompt_id = recorded.submissions[0]["prompt_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(mock.running().as_deref(), Some(prompt_id.as_str()));

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancel did not unblock execute")
        .unwrap();
    assert_matches!(result, Err(BackendError::Cancelled));
    assert!(manager.pending_prompts().is_empty());

    // The server-side stop runs after execute has returned.
    let recorded = mock.wait_until(|r| r.interrupts == 1).await;
    assert_eq!(recorded.deleted, vec![prompt_id]);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: cancelling while POST /prompt is in flight returns at once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_during_stalled_submission_returns_promptly() {
    let mock = MockComfyUI::start(Script::Stall).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, cancel) = request(workflow(), dir.path());
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(req).await })
    };

    let recorded = mock.wait_for_submissions(1).await;
    let requested = recorded.submissions[0]["prompt_id"]
        .as_str()
        .unwrap()
        .to_string();

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("cancel did not unblock a stalled submission")
        .unwrap();
    assert_matches!(result, Err(BackendError::Cancelled));
    assert!(manager.pending_prompts().is_empty());

    // The prompt may still land in the queue, so it is deleted by the ID we asked for.
    let recorded = mock.wait_until(|r| !r.deleted.is_empty()).await;
    assert_eq!(recorded.deleted, vec![requested]);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: the HTTP request timeout bounds a stalled submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_timeout_bounds_stalled_submission() {
    let mock = MockComfyUI::start(Script::Stall).await;
    let config = ComfyUIConfig {
        request_timeout: Duration::from_millis(300),
        ..mock.config()
    };
    let manager = ComfyUIManager::start(config).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, _cancel) = request(workflow(), dir.path());
    let result = tokio::time::timeout(Duration::from_secs(3), manager.execute(req))
        .await
        .expect("stalled submission was not timed out");

    assert_matches!(result, Err(BackendError::Unavailable(_)));
    assert!(manager.pending_prompts().is_empty());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: server-assigned prompt IDs are followed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_assigned_prompt_id_is_tracked() {
    let mock = MockComfyUI::start(Script::Succeed).await;
    mock.ignore_requested_prompt_id();
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, _cancel) = request(workflow(), dir.path());
    let output = tokio::time::timeout(Duration::from_secs(5), manager.execute(req))
        .await
        .expect("execution timed out")
        .unwrap();

    let recorded = mock.recorded();
    assert_ne!(recorded.submissions[0]["prompt_id"], json!(output.prompt_id));
    assert_eq!(output.files.len(), 1);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: completions missed while disconnected resolve from history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_reconciles_pending_prompts_from_history() {
    let mock = MockComfyUI::start(Script::HistoryOnly).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();
    let mut events = manager.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, _cancel) = request(workflow(), dir.path());
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(req).await })
    };

    mock.wait_for_submissions(1).await;
    mock.drop_connections();

    let output = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("reconciliation did not resolve the prompt")
        .unwrap()
        .unwrap();
    assert_eq!(
        output.outputs["9"]["images"][0]["filename"],
        json!("late.png")
    );
    assert_eq!(output.files.len(), 1);

    let reconnected = tokio::time::timeout(Duration::from_secs(5), async {
        let mut disconnected = false;
        loop {
            match events.recv().await {
                Ok(ComfyUIEvent::Disconnected { .. }) => disconnected = true,
                Ok(ComfyUIEvent::Connected { .. }) if disconnected => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(reconnected);
    assert!(manager.is_connected());
    assert!(mock.recorded().ws_connections >= 2);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: shutdown releases executions that are still waiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_releases_pending_executions() {
    let mock = MockComfyUI::start(Script::Hang).await;
    let manager = ComfyUIManager::start(mock.config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, _cancel) = request(workflow(), dir.path());
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(req).await })
    };
    mock.wait_for_submissions(1).await;

    manager.shutdown().await;
    assert!(!manager.is_connected());

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("shutdown did not unblock execute")
        .unwrap();
    assert_matches!(result, Err(BackendError::Unavailable(_)));

    let (req, _progress, _cancel) = request(workflow(), dir.path());
    assert_matches!(manager.execute(req).await, Err(BackendError::Unavailable(_)));
}

// ---------------------------------------------------------------------------
// Test: once reconnecting gives up, new executions fail fast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_after_reconnect_gives_up_is_unavailable() {
    let mock = MockComfyUI::start(Script::Succeed).await;
    let mut config = mock.config();
    config.reconnect.max_attempts = Some(2);
    let manager = ComfyUIManager::start(config).await.unwrap();
    assert!(manager.is_available());

    mock.refuse_websockets();
    mock.drop_connections();

    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.is_available() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("manager still available after reconnecting gave up");
    assert!(!manager.is_connected());

    let dir = tempfile::tempdir().unwrap();
    let (req, _progress, _cancel) = request(workflow(), dir.path());
    let result = tokio::time::timeout(Duration::from_secs(1), manager.execute(req))
        .await
        .expect("execute waited on a listener that is gone");

    assert_matches!(result, Err(BackendError::Unavailable(_)));
    assert!(manager.pending_prompts().is_empty());
    assert!(mock.recorded().submissions.is_empty());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: nothing listening on the port ends in a startup timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_times_out_without_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = ComfyUIConfig {
        host: "127.0.0.1".into(),
        port,
        startup_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let err = ComfyUIManager::start(config)
        .await
        .err()
        .expect("start should fail");
    assert_matches!(
        err,
        ComfyUIManagerError::Launch(LaunchError::StartupTimeout { .. })
    );
}
