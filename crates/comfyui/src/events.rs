//! Events broadcast by [`crate::manager::ComfyUIManager`].
//!
//! Produced by the listener after interpreting raw WebSocket messages for
//! prompts this process submitted. Subscribers get them through
//! [`crate::manager::ComfyUIManager::subscribe`].

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComfyUIEvent {
    /// The WebSocket connection was established (or re-established).
    Connected { client_id: String },

    /// The WebSocket connection was lost.
    Disconnected { client_id: String },

    /// One of our prompts started executing.
    ExecutionStarted { prompt_id: String },

    /// Step progress for one of our prompts.
    Progress {
        prompt_id: String,
        /// Completion percentage (0-100) of the node currently running.
        percent: u8,
        node: Option<String>,
    },

    /// One of our prompts finished successfully.
    Completed {
        prompt_id: String,
        /// Per-node outputs accumulated from `executed` messages.
        outputs: serde_json::Value,
    },

    /// One of our prompts failed.
    Failed {
        prompt_id: String,
        node_id: Option<String>,
        error: String,
    },

    /// One of our prompts was interrupted.
    Interrupted { prompt_id: String },
}
