//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, per-prompt execution tracking, the HTTP
//! API wrapper, reconnection logic, server process launching, and the
//! [`manager::ComfyUIManager`] that ties them together behind the
//! [`studio_core::backend::GenerationBackend`] trait.

pub mod api;
pub mod client;
pub mod events;
pub mod launcher;
pub mod manager;
pub mod messages;
pub mod outputs;
pub mod processor;
pub mod reconnect;
pub mod tracker;
