use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{ExecutionMetadata, Job, JobChange, NewJob, Status};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::DbHandle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("a job with idempotency key {0:?} already exists")]
    DuplicateIdempotencyKey(String),
    #[error("invalid job metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// The persisted job table.
///
/// Every mutation of an existing row goes through [`JobStore::transition`],
/// which only applies when the row's current status is one of `expected`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// Newest job carrying `fingerprint` whose status is one of `statuses`.
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
        statuses: &[Status],
    ) -> Result<Option<Job>, StoreError>;

    /// Compare-and-swap on status. Returns `Ok(None)` when the row exists but
    /// its status is not in `expected`.
    async fn transition(
        &self,
        id: Uuid,
        expected: &[Status],
        update: JobUpdate,
    ) -> Result<Option<Job>, StoreError>;

    /// Ids of active jobs whose `started_at` (or `updated_at` when never
    /// started) is older than `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError>;

    /// Fails the given jobs, skipping any that are no longer active or that
    /// have been touched since `cutoff` (claimed or advanced by a worker).
    async fn fail_stale(
        &self,
        ids: &[Uuid],
        cutoff: DateTime<Utc>,
        message: &str,
        code: &str,
    ) -> Result<u64, StoreError>;

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<JobChange>;
}

/// A status write together with the columns that status implies.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    status: Status,
    result_url: Option<String>,
    error: Option<(String, String)>,
    metadata: Option<ExecutionMetadata>,
}

impl JobUpdate {
    /// Moves to an intermediate state.
    pub fn advance(status: Status, metadata: ExecutionMetadata) -> Self {
        debug_assert!(status.is_active(), "advance() is for active states only");
        Self {
            status,
            result_url: None,
            error: None,
            metadata: Some(metadata),
        }
    }

    pub fn completed(result_url: String, metadata: ExecutionMetadata) -> Self {
        Self {
            status: Status::Completed,
            result_url: Some(result_url),
            error: None,
            metadata: Some(metadata),
        }
    }

    pub fn failed(
        message: impl Into<String>,
        code: &str,
        metadata: Option<ExecutionMetadata>,
    ) -> Self {
        Self {
            status: Status::Failed,
            result_url: None,
            error: Some((message.into(), code.to_string())),
            metadata,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Applies the update to an in-memory row. Metadata is merged, never
    /// replaced, and `result_url` is only ever present on completed rows.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        job.status = self.status;
        job.updated_at = now;

        match self.status {
            Status::Completed => {
                job.result_url.clone_from(&self.result_url);
                job.error = None;
                job.error_code = None;
                job.finished_at = Some(now);
            }
            Status::Failed => {
                job.result_url = None;
                if let Some((message, code)) = &self.error {
                    job.error = Some(message.clone());
                    job.error_code = Some(code.clone());
                }
                job.finished_at = Some(now);
            }
            Status::Generating => {
                job.result_url = None;
                if job.started_at.is_none() {
                    job.started_at = Some(now);
                }
            }
            Status::Processing | Status::Saving => {
                job.result_url = None;
            }
        }

        if let Some(metadata) = &self.metadata {
            job.execution_metadata.0.merge(metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            status: Status::Saving,
            input_url: Some("https://x/a.jpg".into()),
            prompt: Some("enhance".into()),
            category: None,
            user_id: None,
            result_url: None,
            error: Some("earlier".into()),
            error_code: Some("earlier".into()),
            execution_metadata: Json(ExecutionMetadata::default()),
            created_at: now,
            started_at: Some(now),
            updated_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn completed_sets_url_and_clears_error() {
        let mut job = job();
        let mut meta = ExecutionMetadata::default();
        meta.record_step("completed");

        JobUpdate::completed("https://cdn/x.png".into(), meta).apply(&mut job, Utc::now());

        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.result_url.as_deref(), Some("https://cdn/x.png"));
        assert!(job.error.is_none());
        assert!(job.error_code.is_none());
        assert!(job.finished_at.is_some());
        assert_eq!(job.metadata().last_step(), Some("completed"));
    }

    #[test]
    fn failed_never_carries_a_result() {
        let mut job = job();
        job.result_url = Some("https://cdn/stale.png".into());

        JobUpdate::failed("boom", crate::codes::WORKER_ERROR, None).apply(&mut job, Utc::now());

        assert_eq!(job.status, Status::Failed);
        assert!(job.result_url.is_none());
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.error_code.as_deref(), Some(crate::codes::WORKER_ERROR));
    }

    #[test]
    fn generating_stamps_started_at_once() {
        let mut job = job();
        job.status = Status::Processing;
        job.started_at = None;

        let first = Utc::now();
        JobUpdate::advance(Status::Generating, ExecutionMetadata::default()).apply(&mut job, first);
        assert_eq!(job.started_at, Some(first));

        let later = first + chrono::Duration::seconds(5);
        JobUpdate::advance(Status::Generating, ExecutionMetadata::default()).apply(&mut job, later);
        assert_eq!(job.started_at, Some(first));
    }
}
