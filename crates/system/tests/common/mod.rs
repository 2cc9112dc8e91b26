//! Shared fixtures: an in-memory backend and a system rooted in a
//! temporary directory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use studio_core::backend::{BackendError, ExecutionOutput, ExecutionRequest, GenerationBackend};
use studio_core::run::{RunStatus, WorkflowRun};
use studio_core::types::WorkflowId;
use studio_system::config::StudioConfig;
use studio_system::system::SystemManager;
use studio_workflow::manager::WorkflowConfig;

pub struct FakeBackend {
    block: bool,
    started: AtomicUsize,
    workflows: Mutex<Vec<Value>>,
}

impl FakeBackend {
    /// Completes every execution immediately.
    pub fn succeeding() -> Arc<Self> {
        Self::new(false)
    }

    /// Holds every execution until it is cancelled.
    pub fn blocking() -> Arc<Self> {
        Self::new(true)
    }

    fn new(block: bool) -> Arc<Self> {
        Arc::new(Self {
            block,
            started: AtomicUsize::new(0),
            workflows: Mutex::new(Vec::new()),
        })
    }

    pub fn workflows(&self) -> Vec<Value> {
        self.workflows.lock().unwrap().clone()
    }

    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend was not called in time");
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, BackendError> {
        self.workflows
            .lock()
            .unwrap()
            .push(request.workflow.clone().into_value());
        self.started.fetch_add(1, Ordering::SeqCst);

        if self.block {
            request.progress.send_replace(10);
            request.cancel.cancelled().await;
            return Err(BackendError::Cancelled);
        }
        Ok(ExecutionOutput {
            prompt_id: "fake-prompt".into(),
            outputs: json!({}),
            files: Vec::new(),
        })
    }
}

/// A started system with `image_gen` and `code_gen` templates and no
/// `game_dev` template.
pub struct Fixture {
    pub dir: TempDir,
    pub system: SystemManager,
}

pub async fn started(backend: Arc<FakeBackend>, max_concurrent: usize) -> Fixture {
    let fx = stopped(max_concurrent);
    fx.system.start_with_backend(backend).await.unwrap();
    fx
}

pub fn stopped(max_concurrent: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let templates_dir = dir.path().join("templates");
    std::fs::create_dir_all(&templates_dir).unwrap();
    let template = json!({
        "prompt": "",
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "{{prompt}}"}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}}
    });
    for name in ["image_gen", "code_gen"] {
        std::fs::write(
            templates_dir.join(format!("{name}.json")),
            serde_json::to_vec(&template).unwrap(),
        )
        .unwrap();
    }

    let config = StudioConfig {
        workflow: WorkflowConfig {
            workflows_dir: dir.path().join("workflows"),
            templates_dir,
            output_dir: dir.path().join("output"),
            max_concurrent,
            ..Default::default()
        },
        ..Default::default()
    };
    Fixture {
        dir,
        system: SystemManager::new(config),
    }
}

/// Poll until the task reaches `status`.
pub async fn wait_for_status(
    system: &SystemManager,
    id: WorkflowId,
    status: RunStatus,
) -> WorkflowRun {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let run = system.get_task_status(id).await.unwrap();
            if run.status == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not reach the expected status")
}
