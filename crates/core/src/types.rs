/// Workflow runs are identified by a locally generated UUID v4.
pub type WorkflowId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
