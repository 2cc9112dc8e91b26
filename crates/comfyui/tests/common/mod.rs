//! In-process mock of the ComfyUI HTTP and WebSocket API.
//!
//! Serves just enough of the real server's surface for `ComfyUIManager`
//! to launch against: readiness check, prompt submission, queue
//! inspection and deletion, interrupt, history, file download, and the
//! event WebSocket. Each accepted prompt plays back a scripted sequence of
//! WebSocket frames.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use studio_comfyui::manager::ComfyUIConfig;
use studio_comfyui::reconnect::ReconnectConfig;

/// Bytes served by `GET /view` for every file.
pub const FILE_BYTES: &[u8] = b"fake-png-bytes";

/// What the mock does with each accepted prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Start, report progress, emit one image output, finish.
    Succeed,
    /// Start, then fail in node 3.
    Fail,
    /// Start and keep running until interrupted.
    Hang,
    /// Record a successful history entry but send no frames.
    HistoryOnly,
    /// Record the submission and never answer `POST /prompt`.
    Stall,
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    /// Request bodies of every `POST /prompt`.
    pub submissions: Vec<Value>,
    /// IDs passed to `POST /queue` deletes.
    pub deleted: Vec<String>,
    pub interrupts: usize,
    pub ws_connections: usize,
}

#[derive(Debug, Clone)]
enum Frame {
    Text(String),
    Close,
}

struct MockState {
    script: Mutex<Script>,
    /// Assign server-side IDs instead of honouring the requested one.
    ignore_prompt_id: Mutex<bool>,
    /// Answer WebSocket upgrades with 503.
    refuse_ws: Mutex<bool>,
    recorded: Mutex<Recorded>,
    running: Mutex<Option<String>>,
    history: Mutex<HashMap<String, Value>>,
    frames: broadcast::Sender<Frame>,
}

pub struct MockComfyUI {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockComfyUI {
    pub async fn start(script: Script) -> Self {
        let (frames, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            script: Mutex::new(script),
            ignore_prompt_id: Mutex::new(false),
            refuse_ws: Mutex::new(false),
            recorded: Mutex::new(Recorded::default()),
            running: Mutex::new(None),
            history: Mutex::new(HashMap::new()),
            frames,
        });

        let app = Router::new()
            .route("/system_stats", get(system_stats))
            .route("/prompt", post(submit_prompt))
            .route("/queue", get(get_queue).post(delete_from_queue))
            .route("/interrupt", post(interrupt))
            .route("/history/{prompt_id}", get(get_history))
            .route("/view", get(view_file))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        Self {
            addr,
            state,
            server,
        }
    }

    /// Manager configuration pointing at this mock, with short timeouts.
    pub fn config(&self) -> ComfyUIConfig {
        ComfyUIConfig {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            startup_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_attempts: Some(50),
            },
            ..Default::default()
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.state.script.lock().unwrap() = script;
    }

    pub fn ignore_requested_prompt_id(&self) {
        *self.state.ignore_prompt_id.lock().unwrap() = true;
    }

    /// Reject every later WebSocket upgrade, so reconnecting fails.
    pub fn refuse_websockets(&self) {
        *self.state.refuse_ws.lock().unwrap() = true;
    }

    pub fn recorded(&self) -> Recorded {
        self.state.recorded.lock().unwrap().clone()
    }

    pub fn running(&self) -> Option<String> {
        self.state.running.lock().unwrap().clone()
    }

    /// Close every open WebSocket from the server side.
    pub fn drop_connections(&self) {
        let _ = self.state.frames.send(Frame::Close);
    }

    /// Wait until at least `n` prompts have been submitted.
    pub async fn wait_for_submissions(&self, n: usize) -> Recorded {
        self.wait_until(|r| r.submissions.len() >= n).await
    }

    pub async fn wait_until(&self, check: impl Fn(&Recorded) -> bool) -> Recorded {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let recorded = self.recorded();
                if check(&recorded) {
                    return recorded;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("mock condition not reached in time")
    }
}

impl Drop for MockComfyUI {
    fn drop(&mut self) {
        self.server.abort();
    }
}

// ---- handlers ----

async fn system_stats() -> Json<Value> {
    Json(json!({"system": {"os": "posix", "python_version": "3.11"}, "devices": []}))
}

async fn submit_prompt(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let empty = body
        .get("prompt")
        .and_then(Value::as_object)
        .map_or(true, |p| p.is_empty());
    if empty {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {"type": "prompt_no_outputs", "message": "Prompt has no outputs"},
                "node_errors": {}
            })),
        )
            .into_response();
    }

    let requested = body.get("prompt_id").and_then(Value::as_str);
    let ignore = *state.ignore_prompt_id.lock().unwrap();
    let prompt_id = match requested {
        Some(id) if !ignore => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let number = {
        let mut recorded = state.recorded.lock().unwrap();
        recorded.submissions.push(body.clone());
        recorded.submissions.len() as i64 - 1
    };

    let script = *state.script.lock().unwrap();
    if script == Script::Stall {
        std::future::pending::<()>().await;
    }
    play(&state, script, &prompt_id);

    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}})).into_response()
}

async fn get_queue(State(state): State<Arc<MockState>>) -> Json<Value> {
    let running: Vec<Value> = state
        .running
        .lock()
        .unwrap()
        .iter()
        .map(|id| json!([0, id, {}, {}, []]))
        .collect();
    Json(json!({"queue_running": running, "queue_pending": []}))
}

async fn delete_from_queue(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    if let Some(ids) = body.get("delete").and_then(Value::as_array) {
        let mut recorded = state.recorded.lock().unwrap();
        recorded
            .deleted
            .extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    StatusCode::OK
}

async fn interrupt(State(state): State<Arc<MockState>>) -> StatusCode {
    state.recorded.lock().unwrap().interrupts += 1;
    let running = state.running.lock().unwrap().take();
    if let Some(prompt_id) = running {
        send(
            &state,
            json!({"type": "execution_interrupted", "data": {"prompt_id": prompt_id, "node_id": "3"}}),
        );
    }
    StatusCode::OK
}

async fn get_history(
    State(state): State<Arc<MockState>>,
    Path(prompt_id): Path<String>,
) -> Json<Value> {
    let history = state.history.lock().unwrap();
    match history.get(&prompt_id) {
        Some(entry) => Json(json!({ prompt_id: entry })),
        None => Json(json!({})),
    }
}

async fn view_file(Query(params): Query<HashMap<String, String>>) -> Response {
    if params.get("filename").is_some_and(|f| !f.is_empty()) {
        FILE_BYTES.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn ws_upgrade(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !params.contains_key("clientId") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if *state.refuse_ws.lock().unwrap() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.recorded.lock().unwrap().ws_connections += 1;
    // Subscribe before the upgrade completes so no frame is missed.
    let rx = state.frames.subscribe();
    ws.on_upgrade(move |socket| forward_frames(socket, rx))
}

async fn forward_frames(mut socket: WebSocket, mut rx: broadcast::Receiver<Frame>) {
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}});
    if socket
        .send(Message::Text(status.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(Frame::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Ok(Frame::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                None | Some(Err(_)) => return,
            },
        }
    }
}

// ---- script playback ----

fn send(state: &MockState, frame: Value) {
    let _ = state.frames.send(Frame::Text(frame.to_string()));
}

fn play(state: &Arc<MockState>, script: Script, prompt_id: &str) {
    let id = prompt_id.to_string();
    match script {
        Script::HistoryOnly => {
            state.history.lock().unwrap().insert(
                id.clone(),
                json!({
                    "outputs": {"9": {"images": [{"filename": "late.png", "subfolder": "", "type": "output"}]}},
                    "status": {"status_str": "success", "completed": true, "messages": []}
                }),
            );
            return;
        }
        Script::Hang => {
            *state.running.lock().unwrap() = Some(id.clone());
        }
        Script::Succeed | Script::Fail | Script::Stall => {}
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&state, json!({"type": "execution_start", "data": {"prompt_id": id}}));
        send(&state, json!({"type": "executing", "data": {"node": "3", "prompt_id": id}}));
        match script {
            Script::Succeed => {
                send(
                    &state,
                    json!({"type": "progress", "data": {"value": 1, "max": 2, "prompt_id": id, "node": "3"}}),
                );
                send(
                    &state,
                    json!({"type": "executed", "data": {
                        "node": "9",
                        "output": {"images": [{"filename": "result.png", "subfolder": "", "type": "output"}]},
                        "prompt_id": id
                    }}),
                );
                send(&state, json!({"type": "executing", "data": {"node": null, "prompt_id": id}}));
                send(&state, json!({"type": "execution_success", "data": {"prompt_id": id}}));
            }
            Script::Fail => {
                send(
                    &state,
                    json!({"type": "execution_error", "data": {
                        "prompt_id": id,
                        "node_id": "3",
                        "node_type": "KSampler",
                        "exception_message": "CUDA out of memory",
                        "exception_type": "torch.cuda.OutOfMemoryError"
                    }}),
                );
            }
            Script::Hang | Script::HistoryOnly | Script::Stall => {}
        }
    });
}
