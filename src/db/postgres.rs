use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::{JobStore, JobUpdate, StoreError};
use crate::{Job, JobChange, NewJob, Status};

const JOB_COLUMNS: &str = "id, status, input_url, prompt, category, user_id, result_url, \
    error, error_code, execution_metadata, created_at, started_at, updated_at, finished_at";

const CHANGES_CHANNEL: &str = "jobs_changes";

/// Unique partial index over `execution_metadata ->> 'idempotency_key'`.
const IDEMPOTENCY_INDEX: &str = "jobs_idempotency_key_uniq";

/// PostgreSQL backed job store.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
    changes: broadcast::Sender<JobChange>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        let (changes, _) = broadcast::channel(256);
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANGES_CHANNEL).await?;
        tokio::spawn(forward_notifications(listener, changes.clone()));

        Ok(DbHandle {
            pool: Arc::new(pool),
            changes,
        })
    }

    fn active_statuses() -> Vec<String> {
        Status::ACTIVE.iter().map(|s| s.as_str().to_string()).collect()
    }
}

async fn forward_notifications(mut listener: PgListener, changes: broadcast::Sender<JobChange>) {
    loop {
        match listener.recv().await {
            Ok(notification) => match serde_json::from_str::<JobChange>(notification.payload()) {
                // no receivers is fine
                Ok(change) => {
                    let _ = changes.send(change);
                }
                Err(err) => warn!(message = "Malformed job notification", error = %err),
            },
            Err(err) => {
                // PgListener reconnects on the next recv
                error!(message = "Job notification listener failed", error = %err);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl JobStore for DbHandle {
    #[instrument(name = "db.insert", skip_all, fields(job_id))]
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let id = Uuid::new_v4();
        tracing::Span::current().record("job_id", tracing::field::display(id));
        debug!("Inserting job {}", id);

        let row = sqlx::query_as::<_, Job>(&format!(
            "INSERT INTO jobs \
                (id, status, input_url, prompt, category, user_id, execution_metadata) \
            VALUES ($1, 'processing', $2, $3, $4, $5, $6) \
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(&job.input_url)
        .bind(&job.prompt)
        .bind(&job.category)
        .bind(&job.user_id)
        .bind(Json(&job.execution_metadata))
        .fetch_one(&*self.pool)
        .await
        .map_err(|err| {
            let duplicate = matches!(
                &err,
                sqlx::Error::Database(db) if db.constraint() == Some(IDEMPOTENCY_INDEX)
            );
            match (duplicate, &job.execution_metadata.idempotency_key) {
                (true, Some(key)) => StoreError::DuplicateIdempotencyKey(key.clone()),
                _ => StoreError::from(err),
            }
        })?;

        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(
            sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?,
        )
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
            WHERE execution_metadata ->> 'idempotency_key' = $1 \
            ORDER BY created_at ASC \
            LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
        statuses: &[Status],
    ) -> Result<Option<Job>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        Ok(sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
            WHERE execution_metadata ->> 'fingerprint' = $1 \
                AND status::text = ANY($2) \
            ORDER BY created_at DESC \
            LIMIT 1"
        ))
        .bind(fingerprint)
        .bind(statuses)
        .fetch_optional(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.transition", skip_all, fields(job_id = %id, to = %update.status()))]
    async fn transition(
        &self,
        id: Uuid,
        expected: &[Status],
        update: JobUpdate,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut job) = current else {
            return Err(StoreError::NotFound(id));
        };
        if !expected.contains(&job.status) {
            debug!("Transition skipped, job is {}", job.status);
            return Ok(None);
        }

        update.apply(&mut job, Utc::now());

        sqlx::query(
            "UPDATE jobs \
                SET status = $2, \
                result_url = $3, \
                error = $4, \
                error_code = $5, \
                execution_metadata = $6, \
                started_at = $7, \
                updated_at = $8, \
                finished_at = $9 \
            WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.status)
        .bind(&job.result_url)
        .bind(&job.error)
        .bind(&job.error_code)
        .bind(&job.execution_metadata)
        .bind(job.started_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        debug!("Getting up to {} stale jobs", limit);
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM jobs \
            WHERE status::text = ANY($1) \
                AND COALESCE(started_at, updated_at) < $2 \
            ORDER BY updated_at ASC \
            LIMIT $3",
        )
        .bind(Self::active_statuses())
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?)
    }

    async fn fail_stale(
        &self,
        ids: &[Uuid],
        cutoff: DateTime<Utc>,
        message: &str,
        code: &str,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        // Both halves of the selection predicate are re-checked: a job that
        // finished, or was claimed, since the select is left alone.
        let result = sqlx::query(
            "UPDATE jobs \
                SET status = 'failed', \
                result_url = NULL, \
                error = $3, \
                error_code = $4, \
                finished_at = now(), \
                updated_at = now(), \
                execution_metadata = jsonb_set( \
                    execution_metadata, \
                    '{steps}', \
                    COALESCE(execution_metadata -> 'steps', '[]'::jsonb) \
                        || jsonb_build_array(jsonb_build_object('name', 'scavenged', 'start_time', to_jsonb(now()))) \
                ) \
            WHERE id = ANY($1) \
                AND status::text = ANY($2) \
                AND COALESCE(started_at, updated_at) < $5",
        )
        .bind(ids)
        .bind(Self::active_statuses())
        .bind(message)
        .bind(code)
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.changes.subscribe()
    }
}
