//! Domain types shared by every studio crate.
//!
//! Nothing in here performs I/O: workflow graphs, task types, run records
//! and the [`backend::GenerationBackend`] seam are plain data plus pure
//! state transitions, so they can be tested without a generation server.

pub mod backend;
pub mod error;
pub mod graph;
pub mod run;
pub mod task;
pub mod types;
