//! Periodic cleanup of old workflow runs and files.
//!
//! Calls [`WorkflowManager::cleanup_old_workflows`] on a fixed interval
//! using `tokio::time::interval`. The first pass runs immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::manager::WorkflowManager;

/// How often the cleanup job runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour

/// Run the cleanup loop with the manager's configured retention until
/// `cancel` is triggered.
pub async fn run(manager: Arc<WorkflowManager>, cancel: CancellationToken) {
    let retention = manager.config().retention;
    run_every(manager, retention, CLEANUP_INTERVAL, cancel).await;
}

pub async fn run_every(
    manager: Arc<WorkflowManager>,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_hours = retention.as_secs() / 3600,
        interval_secs = every.as_secs(),
        "Workflow retention job started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Workflow retention job stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = manager.cleanup_old_workflows(retention).await {
                    tracing::error!(error = %e, "Workflow retention: cleanup failed");
                }
            }
        }
    }
}
