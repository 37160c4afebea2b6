//! Submission: validate, deduplicate, persist, dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::db::{JobStore, JobUpdate, StoreError};
use crate::fingerprint::{fingerprint, FingerprintInput};
use crate::metadata::GenerationParams;
use crate::provider::aspect::AspectMode;
use crate::provider::payload::MAX_REFERENCE_IMAGES;
use crate::provider::Resolution;
use crate::queue::{JobQueue, WorkerPayload};
use crate::{codes, ExecutionMetadata, Job, NewJob, Status};

/// Body of `POST /generate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub strength: Option<f32>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub reference_image_urls: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The job exists but was marked failed because it could not be queued.
    #[error("failed to dispatch job {job_id}: {message}")]
    Dispatch { job_id: Uuid, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: Uuid,
    pub session_id: String,
    pub status: Status,
    pub seed: Option<u32>,
    /// True when an existing job was returned instead of creating one.
    pub reused: bool,
}

impl Submission {
    fn existing(job: &Job) -> Self {
        let meta = job.metadata();
        Self {
            job_id: job.id,
            session_id: meta.session_id.clone().unwrap_or_default(),
            status: job.status,
            seed: meta.params.as_ref().map(|p| p.seed),
            reused: true,
        }
    }
}

pub struct Submitter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    worker_url: String,
    queue_name: Option<String>,
    default_resolution: Resolution,
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Submitter {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, worker_url: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            worker_url: worker_url.into(),
            queue_name: None,
            default_resolution: Resolution::default(),
        }
    }

    pub fn with_queue_name(mut self, name: Option<String>) -> Self {
        self.queue_name = name;
        self
    }

    pub fn with_default_resolution(mut self, resolution: Resolution) -> Self {
        self.default_resolution = resolution;
        self
    }

    /// `idempotency_key` from a header takes precedence over the body field.
    #[instrument(skip_all)]
    pub async fn submit(
        &self,
        request: SubmitRequest,
        original_body: Value,
        caller_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<Submission, SubmitError> {
        let image_url = trimmed(&request.image_url);
        let prompt = trimmed(&request.prompt);
        if image_url.is_none() && prompt.is_none() {
            return Err(SubmitError::Validation("imageUrl or prompt is required".into()));
        }
        if let Some(strength) = request.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(SubmitError::Validation(format!(
                    "strength must be between 0 and 1, got {strength}"
                )));
            }
        }
        let aspect_ratio = trimmed(&request.aspect_ratio);
        if let Some(ratio) = &aspect_ratio {
            ratio
                .parse::<AspectMode>()
                .map_err(|err| SubmitError::Validation(err.to_string()))?;
        }
        let reference_image_urls: Vec<String> = request
            .reference_image_urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if reference_image_urls.len() > MAX_REFERENCE_IMAGES {
            return Err(SubmitError::Validation(format!(
                "at most {MAX_REFERENCE_IMAGES} referenceImageUrls are allowed"
            )));
        }

        let idempotency_key = trimmed(&idempotency_key).or_else(|| trimmed(&request.idempotency_key));
        if let Some(key) = &idempotency_key {
            if let Some(job) = self.store.find_by_idempotency_key(key).await? {
                info!(message = "Idempotent replay", job_id = %job.id);
                return Ok(Submission::existing(&job));
            }
        }

        let category = trimmed(&request.category);
        let seed = request.seed.unwrap_or_else(rand::random);
        let resolution = request.resolution.unwrap_or(self.default_resolution);
        let fingerprint = fingerprint(&FingerprintInput {
            image_url: image_url.as_deref(),
            prompt: prompt.as_deref(),
            category: category.as_deref(),
            strength: request.strength,
            seed,
            resolution,
            aspect_ratio: aspect_ratio.as_deref(),
            reference_image_urls: &reference_image_urls,
        });

        let mut coalesce_on = Status::ACTIVE.to_vec();
        coalesce_on.push(Status::Completed);
        if let Some(job) = self.store.find_by_fingerprint(&fingerprint, &coalesce_on).await? {
            info!(message = "Coalesced with equivalent job", job_id = %job.id, status = %job.status);
            return Ok(Submission::existing(&job));
        }

        let session_id = trimmed(&request.session_id).unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut metadata = ExecutionMetadata {
            idempotency_key,
            fingerprint: Some(fingerprint),
            session_id: Some(session_id.clone()),
            callback_url: Some(self.worker_url.clone()),
            params: Some(GenerationParams {
                seed,
                resolution,
                aspect_ratio,
                strength: request.strength,
                reference_image_urls: reference_image_urls.clone(),
                model: trimmed(&request.model),
            }),
            ..Default::default()
        };
        metadata.diagnostics.queue.clone_from(&self.queue_name);
        metadata.record_step(Status::Processing.as_str());

        let inserted = self
            .store
            .insert(NewJob {
                input_url: image_url.clone(),
                prompt,
                category,
                user_id: caller_id.clone(),
                execution_metadata: metadata,
            })
            .await;
        let job = match inserted {
            Ok(job) => job,
            // a concurrent submission with the same key won the insert
            Err(StoreError::DuplicateIdempotencyKey(key)) => {
                let job = self
                    .store
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or(StoreError::DuplicateIdempotencyKey(key))?;
                info!(message = "Idempotent replay after conflict", job_id = %job.id);
                return Ok(Submission::existing(&job));
            }
            Err(err) => return Err(err.into()),
        };
        info!(message = "Created job", job_id = %job.id);

        let payload = WorkerPayload {
            job_id: job.id,
            session_id: session_id.clone(),
            image_url,
            reference_image_urls,
            original_request_body: original_body,
            caller_id,
        };
        if let Err(err) = self.queue.publish(&self.worker_url, &payload).await {
            let message = err.to_string();
            error!(message = "Dispatch failed", job_id = %job.id, error = %message);
            let mut meta = ExecutionMetadata::default();
            meta.record_step(Status::Failed.as_str());
            self.store
                .transition(
                    job.id,
                    &[Status::Processing],
                    JobUpdate::failed(
                        format!("failed to dispatch job: {message}"),
                        codes::DISPATCH_FAILED,
                        Some(meta),
                    ),
                )
                .await?;
            return Err(SubmitError::Dispatch {
                job_id: job.id,
                message,
            });
        }

        Ok(Submission {
            job_id: job.id,
            session_id,
            status: job.status,
            seed: Some(seed),
            reused: false,
        })
    }
}
