//! Top-level façade over the ComfyUI and workflow managers.
//!
//! [`system::SystemManager`] starts and stops both managers and turns
//! free-text requests into workflow runs. Configuration comes from the
//! environment via [`config::StudioConfig::from_env`].

pub mod classify;
pub mod config;
pub mod console;
pub mod system;
