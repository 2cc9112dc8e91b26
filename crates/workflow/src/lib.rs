//! Workflow creation and execution bookkeeping.
//!
//! [`manager::WorkflowManager`] builds workflow documents from templates,
//! writes them to disk, and drives each run through a
//! [`studio_core::backend::GenerationBackend`] with bounded concurrency,
//! cancellation, and an execution timeout.

pub mod builder;
pub mod error;
pub mod manager;
pub mod registry;
pub mod retention;
pub mod templates;
