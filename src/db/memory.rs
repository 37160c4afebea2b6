use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{JobStore, JobUpdate, StoreError};
use crate::{ExecutionMetadata, Job, JobChange, NewJob, Status};

/// In-process job store used when no database is configured, and by tests.
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    changes: broadcast::Sender<JobChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            jobs: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn notify(&self, job: &Job, deleted: bool) {
        let _ = self.changes.send(JobChange {
            id: job.id,
            status: job.status,
            deleted,
        });
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: Uuid, by: chrono::Duration) {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.created_at -= by;
            job.updated_at -= by;
            job.started_at = job.started_at.map(|at| at - by);
        }
    }
}

fn newest<'a>(jobs: impl Iterator<Item = &'a Job>) -> Option<Job> {
    jobs.max_by_key(|job| job.created_at).cloned()
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let row = Job {
            id: Uuid::new_v4(),
            status: Status::Processing,
            input_url: job.input_url,
            prompt: job.prompt,
            category: job.category,
            user_id: job.user_id,
            result_url: None,
            error: None,
            error_code: None,
            execution_metadata: Json(job.execution_metadata),
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        };
        {
            let mut jobs = self.jobs.write().await;
            if let Some(key) = &row.execution_metadata.0.idempotency_key {
                if jobs
                    .values()
                    .any(|job| job.metadata().idempotency_key.as_ref() == Some(key))
                {
                    return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
                }
            }
            jobs.insert(row.id, row.clone());
        }
        self.notify(&row, false);
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.metadata().idempotency_key.as_deref() == Some(key))
            .min_by_key(|job| job.created_at)
            .cloned())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
        statuses: &[Status],
    ) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(newest(jobs.values().filter(|job| {
            statuses.contains(&job.status)
                && job.metadata().fingerprint.as_deref() == Some(fingerprint)
        })))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[Status],
        update: JobUpdate,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !expected.contains(&job.status) {
            return Ok(None);
        }
        update.apply(job, Utc::now());
        let job = job.clone();
        drop(jobs);

        self.notify(&job, false);
        Ok(Some(job))
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut stale: Vec<&Job> = jobs
            .values()
            .filter(|job| job.status.is_active())
            .filter(|job| job.started_at.unwrap_or(job.updated_at) < cutoff)
            .collect();
        stale.sort_by_key(|job| job.updated_at);
        Ok(stale
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|job| job.id)
            .collect())
    }

    async fn fail_stale(
        &self,
        ids: &[Uuid],
        cutoff: DateTime<Utc>,
        message: &str,
        code: &str,
    ) -> Result<u64, StoreError> {
        let mut failed = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for id in ids {
                let Some(job) = jobs.get_mut(id) else {
                    continue;
                };
                if !job.status.is_active() || job.started_at.unwrap_or(job.updated_at) >= cutoff {
                    continue;
                }
                let mut meta = ExecutionMetadata::default();
                meta.record_step("scavenged");
                JobUpdate::failed(message, code, Some(meta)).apply(job, Utc::now());
                failed.push(job.clone());
            }
        }
        for job in &failed {
            self.notify(job, false);
        }
        Ok(failed.len() as u64)
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut removed = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for id in ids {
                if let Some(job) = jobs.remove(id) {
                    removed.push(job);
                }
            }
        }
        for job in &removed {
            self.notify(job, true);
        }
        Ok(removed.len() as u64)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.changes.subscribe()
    }
}
