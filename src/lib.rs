use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod db;
pub mod fingerprint;
pub mod metadata;
pub mod poller;
pub mod provider;
pub mod queue;
pub mod scavenger;
pub mod server;
pub mod storage;
pub mod submit;
pub mod telemetry;
pub mod worker;

pub use metadata::ExecutionMetadata;

/// Machine readable `error_code` values written next to a failed job's message.
pub mod codes {
    /// The queue refused or never received the job.
    pub const DISPATCH_FAILED: &str = "dispatch_failed";
    /// The provider adapter returned a failure result.
    pub const PROVIDER_ERROR: &str = "provider_error";
    /// Anything else that went wrong inside the worker (upload, fetch, config).
    pub const WORKER_ERROR: &str = "worker_error";
    /// Force-failed by the scavenger after sitting in an active state too long.
    pub const STUCK_TIMEOUT: &str = "stuck_timeout";
}

/// A validated submission about to become a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub input_url: Option<String>,
    pub prompt: Option<String>,
    pub category: Option<String>,
    pub user_id: Option<String>,
    pub execution_metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub status: Status,
    pub input_url: Option<String>,
    pub prompt: Option<String>,
    pub category: Option<String>,
    pub user_id: Option<String>,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub execution_metadata: Json<ExecutionMetadata>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.execution_metadata.0
    }
}

/// Job lifecycle.
///
/// `processing` means accepted but not yet claimed by a worker. A worker claims
/// the job by moving it to `generating`, then `saving`, and finally writes one
/// of the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Processing,
    Generating,
    Saving,
    Completed,
    Failed,
}

impl Status {
    pub const ACTIVE: [Status; 3] = [Status::Processing, Status::Generating, Status::Saving];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Processing => "processing",
            Status::Generating => "generating",
            Status::Saving => "saving",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification for one row of the job table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobChange {
    pub id: Uuid,
    pub status: Status,
    #[serde(default)]
    pub deleted: bool,
}
