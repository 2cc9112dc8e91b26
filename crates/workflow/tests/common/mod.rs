//! Shared fixtures: a scriptable in-memory backend and a manager rooted in
//! a temporary directory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use studio_core::backend::{BackendError, ExecutionOutput, ExecutionRequest, GenerationBackend};
use studio_workflow::manager::{WorkflowConfig, WorkflowManager};

/// What [`FakeBackend::execute`] does.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report some progress, then succeed.
    Succeed,
    /// Fail with an execution error in node 3.
    Fail(String),
    /// Report `percent` progress, then wait until cancelled.
    Block { percent: u8 },
    /// Accept the workflow, then never return, even when cancelled.
    Unresponsive,
}

pub struct FakeBackend {
    behavior: Mutex<Behavior>,
    started: AtomicUsize,
    workflows: Mutex<Vec<Value>>,
}

impl FakeBackend {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            started: AtomicUsize::new(0),
            workflows: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Documents received so far.
    pub fn workflows(&self) -> Vec<Value> {
        self.workflows.lock().unwrap().clone()
    }

    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started() < n {
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
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        self.workflows
            .lock()
            .unwrap()
            .push(request.workflow.clone().into_value());
        let behavior = self.behavior.lock().unwrap().clone();
        request.prompt_id.send_replace(Some(format!("fake-{n}")));

        match behavior {
            Behavior::Succeed => {
                request.progress.send_replace(60);
                tokio::task::yield_now().await;
                Ok(ExecutionOutput {
                    prompt_id: format!("fake-{n}"),
                    outputs: json!({"9": {"images": [{"filename": "out.png"}]}}),
                    files: vec![request.output_dir.join(format!("{}_9_out.png", request.run_id))],
                })
            }
            Behavior::Fail(message) => Err(BackendError::Execution {
                node_id: Some("3".into()),
                message,
            }),
            Behavior::Block { percent } => {
                request.progress.send_replace(percent);
                request.cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
            Behavior::Unresponsive => std::future::pending().await,
        }
    }
}

pub const IMAGE_TEMPLATE: &str = r#"{
    "prompt": "",
    "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "{{prompt}} in the style of {{style}}"}},
    "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 20}},
    "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}}
}"#;

/// A manager over `backend` with an `image_gen` template installed.
pub struct Fixture {
    pub dir: TempDir,
    pub manager: Arc<WorkflowManager>,
}

pub async fn fixture(backend: Arc<FakeBackend>) -> Fixture {
    fixture_with(backend, |_| {}).await
}

pub async fn fixture_with(
    backend: Arc<FakeBackend>,
    tweak: impl FnOnce(&mut WorkflowConfig),
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let templates_dir = dir.path().join("templates");
    std::fs::create_dir_all(&templates_dir).unwrap();
    std::fs::write(templates_dir.join("image_gen.json"), IMAGE_TEMPLATE).unwrap();

    let mut config = WorkflowConfig {
        workflows_dir: dir.path().join("workflows"),
        templates_dir,
        output_dir: dir.path().join("output"),
        ..Default::default()
    };
    tweak(&mut config);

    let manager = WorkflowManager::new(config, backend).await.unwrap();
    Fixture {
        dir,
        manager: Arc::new(manager),
    }
}
