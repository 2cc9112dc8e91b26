//! In-memory table of workflow runs.
//!
//! Each run is stored with the [`CancellationToken`] that stopping it
//! triggers. All status transitions go through [`WorkflowRun`]'s methods
//! while the write lock is held, so a terminal status is never overwritten.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use studio_core::run::WorkflowRun;
use studio_core::types::{Timestamp, WorkflowId};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::WorkflowError;

struct Entry {
    run: WorkflowRun,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct RunRegistry {
    entries: RwLock<HashMap<WorkflowId, Entry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: WorkflowRun) {
        self.entries.write().await.insert(
            run.id,
            Entry {
                run,
                cancel: CancellationToken::new(),
            },
        );
    }

    pub async fn get(&self, id: WorkflowId) -> Option<WorkflowRun> {
        self.entries.read().await.get(&id).map(|e| e.run.clone())
    }

    /// Every run, oldest first.
    pub async fn list(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.run.clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Apply `f` to a run under the write lock.
    pub async fn update<R>(&self, id: WorkflowId, f: impl FnOnce(&mut WorkflowRun) -> R) -> Option<R> {
        self.entries
            .write()
            .await
            .get_mut(&id)
            .map(|e| f(&mut e.run))
    }

    /// Move a run to `running`, returning its cancellation token and
    /// document path.
    pub async fn start(&self, id: WorkflowId) -> Result<(CancellationToken, PathBuf), WorkflowError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(WorkflowError::NotFound(id))?;
        entry
            .run
            .start()
            .map_err(|_| WorkflowError::AlreadyStarted {
                id,
                status: entry.run.status.as_str(),
            })?;
        Ok((entry.cancel.clone(), entry.run.path.clone()))
    }

    /// Stop a run and fire its token. `None` if unknown; `Some(false)` if it
    /// had already finished.
    pub async fn stop(&self, id: WorkflowId) -> Option<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id)?;
        let stopped = entry.run.stop();
        if stopped {
            entry.cancel.cancel();
        }
        Some(stopped)
    }

    /// Stop every run that has not finished. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut stopped = 0;
        for entry in entries.values_mut() {
            if entry.run.stop() {
                entry.cancel.cancel();
                stopped += 1;
            }
        }
        stopped
    }

    /// Document paths of runs that have not finished.
    pub async fn active_paths(&self) -> HashSet<PathBuf> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.run.status.is_terminal())
            .map(|e| e.run.path.clone())
            .collect()
    }

    /// Forget finished runs last updated before `cutoff`.
    pub async fn remove_finished_before(&self, cutoff: Timestamp) -> Vec<WorkflowRun> {
        let mut entries = self.entries.write().await;
        let expired: Vec<WorkflowId> = entries
            .iter()
            .filter(|(_, e)| e.run.status.is_terminal() && e.run.updated_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| e.run))
            .collect()
    }
}
