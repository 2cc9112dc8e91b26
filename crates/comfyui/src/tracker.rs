//! Per-prompt completion tracking.
//!
//! Each submitted prompt registers a waiter before the HTTP submission is
//! sent. The WebSocket listener feeds every parsed message through
//! [`ExecutionTracker::handle`], which accumulates node outputs, forwards
//! progress, and resolves the waiter's oneshot channel on a terminal
//! message. Callers await the receiver alongside a cancellation token, so
//! nothing polls.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch};

use crate::events::ComfyUIEvent;
use crate::messages::ComfyUIMessage;

/// How a tracked prompt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    Completed { outputs: Value },
    Failed {
        node_id: Option<String>,
        message: String,
    },
    Interrupted,
}

struct Waiter {
    done: oneshot::Sender<PromptOutcome>,
    outputs: Map<String, Value>,
    progress: Option<watch::Sender<u8>>,
}

#[derive(Default)]
struct State {
    waiters: HashMap<String, Waiter>,
    /// Prompt most recently seen executing. Used for messages that do not
    /// carry a prompt ID.
    current: Option<String>,
}

/// Registry of prompts awaiting a terminal message.
#[derive(Default)]
pub struct ExecutionTracker {
    state: Mutex<State>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `prompt_id`. A second registration for the same ID
    /// replaces the first, whose receiver then sees a closed channel.
    pub fn register(
        &self,
        prompt_id: &str,
        progress: Option<watch::Sender<u8>>,
    ) -> oneshot::Receiver<PromptOutcome> {
        let (done, rx) = oneshot::channel();
        self.lock().waiters.insert(
            prompt_id.to_string(),
            Waiter {
                done,
                outputs: Map::new(),
                progress,
            },
        );
        rx
    }

    /// Move a waiter to the ID the server actually assigned.
    pub fn rekey(&self, from: &str, to: &str) -> bool {
        let mut state = self.lock();
        match state.waiters.remove(from) {
            Some(waiter) => {
                state.waiters.insert(to.to_string(), waiter);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a prompt without resolving it.
    pub fn forget(&self, prompt_id: &str) -> bool {
        self.lock().waiters.remove(prompt_id).is_some()
    }

    pub fn is_tracked(&self, prompt_id: &str) -> bool {
        self.lock().waiters.contains_key(prompt_id)
    }

    /// IDs of every prompt still awaiting a result.
    pub fn tracked(&self) -> Vec<String> {
        self.lock().waiters.keys().cloned().collect()
    }

    /// Resolve a prompt from outside the message stream (history
    /// reconciliation). Returns `false` if it was not tracked.
    pub fn resolve(&self, prompt_id: &str, outcome: PromptOutcome) -> bool {
        match self.lock().waiters.remove(prompt_id) {
            Some(waiter) => {
                let _ = waiter.done.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        state.current = None;
        let n = state.waiters.len();
        state.waiters.clear();
        n
    }

    /// Apply one WebSocket message. Returns the event to broadcast, if the
    /// message concerns a tracked prompt.
    pub fn handle(&self, msg: &ComfyUIMessage) -> Option<ComfyUIEvent> {
        let mut state = self.lock();
        match msg {
            ComfyUIMessage::ExecutionStart(data) => {
                state.current = Some(data.prompt_id.clone());
                state
                    .waiters
                    .contains_key(&data.prompt_id)
                    .then(|| ComfyUIEvent::ExecutionStarted {
                        prompt_id: data.prompt_id.clone(),
                    })
            }
            ComfyUIMessage::Executing(data) => {
                let prompt_id = data.prompt_id.clone().or_else(|| state.current.clone())?;
                if data.node.is_some() {
                    state.current = Some(prompt_id);
                    return None;
                }
                state.complete(&prompt_id)
            }
            ComfyUIMessage::ExecutionSuccess(data) => state.complete(&data.prompt_id),
            ComfyUIMessage::Executed(data) => {
                if let Some(waiter) = state.waiters.get_mut(&data.prompt_id) {
                    waiter
                        .outputs
                        .insert(data.node.clone(), data.output.clone());
                }
                None
            }
            ComfyUIMessage::Progress(data) => {
                let prompt_id = data.prompt_id.clone().or_else(|| state.current.clone())?;
                let waiter = state.waiters.get(&prompt_id)?;
                let percent = data.percent();
                if let Some(progress) = &waiter.progress {
                    progress.send_replace(percent);
                }
                Some(ComfyUIEvent::Progress {
                    prompt_id,
                    percent,
                    node: data.node.clone(),
                })
            }
            ComfyUIMessage::ExecutionError(data) => {
                let message = if data.exception_message.is_empty() {
                    format!("{} in node {:?}", data.exception_type, data.node_id)
                } else {
                    data.exception_message.clone()
                };
                state.fail(&data.prompt_id, data.node_id.clone(), message)
            }
            ComfyUIMessage::ExecutionInterrupted(data) => {
                state.clear_current(&data.prompt_id);
                let waiter = state.waiters.remove(&data.prompt_id)?;
                let _ = waiter.done.send(PromptOutcome::Interrupted);
                Some(ComfyUIEvent::Interrupted {
                    prompt_id: data.prompt_id.clone(),
                })
            }
            ComfyUIMessage::ServerError { message } => {
                let prompt_id = state.current.clone()?;
                state.fail(&prompt_id, None, message.clone())
            }
            ComfyUIMessage::Status(_)
            | ComfyUIMessage::ExecutionCached(_)
            | ComfyUIMessage::Other { .. } => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn clear_current(&mut self, prompt_id: &str) {
        if self.current.as_deref() == Some(prompt_id) {
            self.current = None;
        }
    }

    fn complete(&mut self, prompt_id: &str) -> Option<ComfyUIEvent> {
        self.clear_current(prompt_id);
        let waiter = self.waiters.remove(prompt_id)?;
        let outputs = Value::Object(waiter.outputs);
        let _ = waiter.done.send(PromptOutcome::Completed {
            outputs: outputs.clone(),
        });
        Some(ComfyUIEvent::Completed {
            prompt_id: prompt_id.to_string(),
            outputs,
        })
    }

    fn fail(
        &mut self,
        prompt_id: &str,
        node_id: Option<String>,
        message: String,
    ) -> Option<ComfyUIEvent> {
        self.clear_current(prompt_id);
        let waiter = self.waiters.remove(prompt_id)?;
        let _ = waiter.done.send(PromptOutcome::Failed {
            node_id: node_id.clone(),
            message: message.clone(),
        });
        Some(ComfyUIEvent::Failed {
            prompt_id: prompt_id.to_string(),
            node_id,
            error: message,
        })
    }
}
