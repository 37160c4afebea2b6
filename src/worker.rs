use crate::db::{JobStore, JobUpdate, StoreError};
use crate::metadata::Timings;
use crate::provider::{imaging, GenerationRequest, GenerationResult, Generator, ImagePayload};
use crate::queue::WorkerPayload;
use crate::storage::{self, ObjectStore, PutOptions, IMMUTABLE_CACHE};
use crate::{codes, ExecutionMetadata, Job, Status};
use anyhow::{anyhow, Context, Error};
use async_channel::Receiver;
use chrono::Utc;
use serde_json::Value;
use std::{sync::Arc, time::Duration, time::Instant};
use tokio::{sync::mpsc::UnboundedSender, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// One handoff of a payload to a worker. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: WorkerPayload,
    pub attempt: u32,
}

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobFinished(Uuid, RunOutcome),
    JobFailed(Delivery, String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { result_url: String },
    Failed { error: String },
    /// Nothing was done: the job is gone or already past `processing`.
    Skipped(Option<Status>),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub fetch_timeout: Duration,
    pub upload_timeout: Duration,
    pub host: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(30),
            host: None,
        }
    }
}

/// Drives a single job from `processing` to a terminal state.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    generator: Arc<dyn Generator>,
    objects: Arc<dyn ObjectStore>,
    backup: Option<Arc<dyn ObjectStore>>,
    http: reqwest::Client,
    config: WorkerConfig,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        generator: Arc<dyn Generator>,
        objects: Arc<dyn ObjectStore>,
        http: reqwest::Client,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            generator,
            objects,
            backup: None,
            http,
            config,
        }
    }

    /// Copies every result to `backup` after the job completes.
    pub fn with_backup(mut self, backup: Option<Arc<dyn ObjectStore>>) -> Self {
        self.backup = backup;
        self
    }

    /// Runs the job named by `payload`.
    ///
    /// Every failure after the claim is written to the job as `failed`; the
    /// only `Err` is a store error while writing that failure.
    #[instrument(skip(self, payload), fields(job_id = %payload.job_id))]
    pub async fn run(&self, payload: &WorkerPayload, delivery: u32) -> Result<RunOutcome, StoreError> {
        let started = Instant::now();
        let id = payload.job_id;

        let mut claim = ExecutionMetadata::default();
        claim.record_step(Status::Generating.as_str());
        claim.diagnostics.host.clone_from(&self.config.host);
        claim.diagnostics.deliveries = Some(delivery);

        let job = match self
            .store
            .transition(id, &[Status::Processing], JobUpdate::advance(Status::Generating, claim))
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                let status = self.store.get(id).await?.map(|job| job.status);
                info!(message = "Job already claimed, skipping delivery", status = ?status);
                return Ok(RunOutcome::Skipped(status));
            }
            Err(StoreError::NotFound(_)) => {
                warn!("Job no longer exists, skipping delivery");
                return Ok(RunOutcome::Skipped(None));
            }
            Err(err) => return Err(err),
        };

        match self.execute(&job, payload, started).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let message = format!("{err:#}");
                error!(message = "Job failed", error = %message);
                let mut meta = ExecutionMetadata::default();
                meta.record_step(Status::Failed.as_str());
                meta.timings = Some(elapsed(started));
                self.store
                    .transition(
                        id,
                        &Status::ACTIVE,
                        JobUpdate::failed(message.clone(), codes::WORKER_ERROR, Some(meta)),
                    )
                    .await?;
                Ok(RunOutcome::Failed { error: message })
            }
        }
    }

    async fn execute(&self, job: &Job, payload: &WorkerPayload, started: Instant) -> Result<RunOutcome, Error> {
        let request = build_request(job, payload)?;
        let generated = match self.generator.generate(&request).await? {
            GenerationResult::Success(image) => image,
            GenerationResult::Failure(failure) => {
                warn!(message = "Provider failed", error = %failure.error);
                let mut meta = ExecutionMetadata::default();
                meta.record_step(Status::Failed.as_str());
                meta.retries = failure.retries.into();
                meta.timings = Some(elapsed(started));
                if !failure.raw.is_null() {
                    meta.extra.insert("provider_raw".into(), failure.raw);
                }
                self.store
                    .transition(
                        job.id,
                        &[Status::Generating],
                        JobUpdate::failed(failure.error.clone(), codes::PROVIDER_ERROR, Some(meta)),
                    )
                    .await?;
                return Ok(RunOutcome::Failed { error: failure.error });
            }
        };

        let mut meta = ExecutionMetadata::default();
        meta.record_step(Status::Saving.as_str());
        meta.retries = generated.retries.into();
        if self
            .store
            .transition(job.id, &[Status::Generating], JobUpdate::advance(Status::Saving, meta))
            .await?
            .is_none()
        {
            return self.lost_job(job.id).await;
        }

        let bytes = match generated.payload {
            ImagePayload::Bytes(bytes) => bytes,
            ImagePayload::Url(url) => timeout(
                self.config.fetch_timeout,
                imaging::fetch(&self.http, &url, self.config.fetch_timeout),
            )
            .await
            .map_err(|_| anyhow!("timed out fetching generated image after {:?}", self.config.fetch_timeout))?
            .context("failed to download generated image")?,
        };

        let session = Some(payload.session_id.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| job.metadata().session_id.clone())
            .unwrap_or_default();
        let key = storage::storage_key(
            &session,
            "output",
            &job.id.to_string(),
            Utc::now().timestamp_millis(),
            storage::extension_for(&generated.mime_type),
        );
        let options = PutOptions {
            content_type: &generated.mime_type,
            cache_control: Some(IMMUTABLE_CACHE),
        };
        let backup_copy = self.backup.as_ref().map(|store| (store.clone(), bytes.clone()));
        timeout(self.config.upload_timeout, self.objects.put(&key, bytes, options))
            .await
            .map_err(|_| anyhow!("timed out uploading result after {:?}", self.config.upload_timeout))?
            .context("failed to upload result")?;
        let result_url = self.objects.public_url(&key);

        let mut meta = ExecutionMetadata::default();
        meta.record_step(Status::Completed.as_str());
        meta.timings = Some(elapsed(started));
        meta.extra.insert("model".into(), Value::String(generated.model));
        if self
            .store
            .transition(job.id, &[Status::Saving], JobUpdate::completed(result_url.clone(), meta))
            .await?
            .is_none()
        {
            return self.lost_job(job.id).await;
        }
        info!(message = "Job completed", result_url = %result_url);

        if let Some((backup, bytes)) = backup_copy {
            let content_type = generated.mime_type;
            tokio::spawn(
                async move {
                    let options = PutOptions {
                        content_type: &content_type,
                        cache_control: Some(IMMUTABLE_CACHE),
                    };
                    if let Err(err) = backup.put(&key, bytes, options).await {
                        warn!(message = "Backup copy failed", key = %key, error = %err);
                    }
                }
                .in_current_span(),
            );
        }

        Ok(RunOutcome::Completed { result_url })
    }

    /// The job left our state while we worked on it, usually the scavenger.
    async fn lost_job(&self, id: Uuid) -> Result<RunOutcome, Error> {
        let status = self.store.get(id).await?.map(|job| job.status);
        warn!(message = "Job was changed by someone else, abandoning", status = ?status);
        Ok(RunOutcome::Skipped(status))
    }
}

fn elapsed(started: Instant) -> Timings {
    Timings {
        total_duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn build_request(job: &Job, payload: &WorkerPayload) -> Result<GenerationRequest, Error> {
    let mut request = GenerationRequest {
        image_url: job.input_url.clone().or_else(|| payload.image_url.clone()),
        prompt: job.prompt.clone().unwrap_or_default(),
        reference_image_urls: payload.reference_image_urls.clone(),
        ..Default::default()
    };
    if let Some(params) = &job.metadata().params {
        request.strength = params.strength;
        request.resolution = params.resolution;
        request.seed = Some(params.seed);
        request.model.clone_from(&params.model);
        if let Some(ratio) = &params.aspect_ratio {
            request.aspect_ratio = ratio.parse().context("stored aspect ratio is invalid")?;
        }
        if !params.reference_image_urls.is_empty() {
            request.reference_image_urls.clone_from(&params.reference_image_urls);
        }
    }
    Ok(request)
}

/// Worker loop: takes deliveries off the queue channel until cancelled.
pub async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Delivery>,
    send_to_server: UnboundedSender<WorkMessage>,
    runner: Arc<JobRunner>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            delivery = recv_from_queue.recv() => {
                let delivery = match delivery {
                    Err(err) => {
                        error!(message = "Error receiving job by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(delivery) => delivery,
                };
                let job_id = delivery.payload.job_id;
                if send_to_server.send(WorkMessage::JobStarted(job_id)).is_err() {
                    error!("Server is gone, worker exiting");
                    break;
                }
                let message = match runner.run(&delivery.payload, delivery.attempt).await {
                    Ok(outcome) => WorkMessage::JobFinished(job_id, outcome),
                    Err(err) => WorkMessage::JobFailed(delivery, err.to_string()),
                };
                if send_to_server.send(message).is_err() {
                    error!("Server is gone, worker exiting");
                    break;
                }
            }
        }
    }
    info!("Worker stopped.");
}
