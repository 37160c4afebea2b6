use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codes;
use crate::db::{JobStore, StoreError};

/// Force-fails jobs that have sat in an active state for too long.
pub struct Scavenger {
    store: Arc<dyn JobStore>,
    stale_after: Duration,
    batch_limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub candidates: usize,
    pub cleaned_count: u64,
    pub duration_ms: u64,
}

impl Scavenger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            stale_after: Duration::from_secs(10 * 60),
            batch_limit: 200,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_batch_limit(mut self, limit: i64) -> Self {
        self.batch_limit = limit;
        self
    }

    #[instrument(name = "scavenger.sweep", skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let ids = self.store.find_stale(cutoff, self.batch_limit).await?;
        let cleaned_count = if ids.is_empty() {
            0
        } else {
            let message = format!(
                "job timed out: no progress for {} minutes",
                self.stale_after.as_secs() / 60
            );
            self.store
                .fail_stale(&ids, cutoff, &message, codes::STUCK_TIMEOUT)
                .await?
        };

        let report = SweepReport {
            candidates: ids.len(),
            cleaned_count,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if cleaned_count > 0 {
            warn!(message = "Failed stuck jobs", cleaned = cleaned_count, candidates = ids.len());
        } else {
            debug!(message = "Nothing to clean", candidates = ids.len());
        }
        Ok(report)
    }

    /// Sweeps every `period` until cancelled.
    pub async fn run_every(&self, period: Duration, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Scavenger Cancelled");
                    break;
                },
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(message = "Sweep failed", error = %err);
                    }
                }
            }
        }
        info!("Scavenger stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobUpdate, MemoryStore};
    use crate::{ExecutionMetadata, NewJob, Status};

    async fn insert(store: &MemoryStore) -> uuid::Uuid {
        store
            .insert(NewJob {
                input_url: Some("https://x/a.jpg".into()),
                prompt: Some("enhance".into()),
                category: None,
                user_id: None,
                execution_metadata: ExecutionMetadata::default(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn fails_only_stale_active_jobs() {
        let store = Arc::new(MemoryStore::new());
        let stale = insert(&store).await;
        let fresh = insert(&store).await;
        let finished = insert(&store).await;
        store
            .transition(
                finished,
                &Status::ACTIVE,
                JobUpdate::completed("http://cdn/x.png".into(), ExecutionMetadata::default()),
            )
            .await
            .unwrap();
        let hour = chrono::Duration::hours(1);
        store.backdate(stale, hour).await;
        store.backdate(finished, hour).await;

        let report = Scavenger::new(store.clone()).sweep().await.unwrap();
        assert_eq!(report.cleaned_count, 1);
        assert_eq!(report.candidates, 1);

        let job = store.get(stale).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.error_code.as_deref(), Some(codes::STUCK_TIMEOUT));
        assert_eq!(job.metadata().last_step(), Some("scavenged"));
        assert_eq!(store.get(fresh).await.unwrap().unwrap().status, Status::Processing);
        assert_eq!(
            store.get(finished).await.unwrap().unwrap().result_url.as_deref(),
            Some("http://cdn/x.png")
        );
    }

    #[tokio::test]
    async fn generating_jobs_are_judged_by_started_at() {
        let store = Arc::new(MemoryStore::new());
        let id = insert(&store).await;
        store
            .transition(
                id,
                &[Status::Processing],
                JobUpdate::advance(Status::Generating, ExecutionMetadata::default()),
            )
            .await
            .unwrap();
        store.backdate(id, chrono::Duration::minutes(11)).await;

        let report = Scavenger::new(store.clone()).sweep().await.unwrap();
        assert_eq!(report.cleaned_count, 1);
    }

    #[tokio::test]
    async fn completion_between_select_and_update_wins() {
        let store = Arc::new(MemoryStore::new());
        let id = insert(&store).await;
        store.backdate(id, chrono::Duration::hours(1)).await;

        // the sweep has selected the job...
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let ids = store.find_stale(cutoff, 200).await.unwrap();
        assert_eq!(ids, vec![id]);

        // ...the worker finishes it...
        store
            .transition(
                id,
                &Status::ACTIVE,
                JobUpdate::completed("http://cdn/done.png".into(), ExecutionMetadata::default()),
            )
            .await
            .unwrap();

        // ...and the conditional update must leave it alone
        let cleaned = store
            .fail_stale(&ids, cutoff, "timed out", codes::STUCK_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(cleaned, 0);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.result_url.as_deref(), Some("http://cdn/done.png"));
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn claim_between_select_and_update_wins() {
        let store = Arc::new(MemoryStore::new());
        let id = insert(&store).await;
        // queued for an hour without being picked up
        store.backdate(id, chrono::Duration::hours(1)).await;

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let ids = store.find_stale(cutoff, 200).await.unwrap();
        assert_eq!(ids, vec![id]);

        // a worker claims it before the update lands
        store
            .transition(
                id,
                &[Status::Processing],
                JobUpdate::advance(Status::Generating, ExecutionMetadata::default()),
            )
            .await
            .unwrap()
            .unwrap();

        let cleaned = store
            .fail_stale(&ids, cutoff, "timed out", codes::STUCK_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(cleaned, 0);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Generating);
        assert!(job.error.is_none());
        assert!(job.started_at.unwrap() > cutoff);
    }

    #[tokio::test]
    async fn batch_is_capped() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..5 {
            let id = insert(&store).await;
            store.backdate(id, chrono::Duration::hours(1)).await;
        }
        let scavenger = Scavenger::new(store.clone()).with_batch_limit(2);
        assert_eq!(scavenger.sweep().await.unwrap().cleaned_count, 2);
        assert_eq!(scavenger.sweep().await.unwrap().cleaned_count, 2);
        assert_eq!(scavenger.sweep().await.unwrap().cleaned_count, 1);
        assert_eq!(scavenger.sweep().await.unwrap().cleaned_count, 0);
    }
}
