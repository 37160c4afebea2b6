use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Header carrying the dispatcher's concurrency limit for the target.
pub const PARALLELISM_HEADER: &str = "x-queue-parallelism";
/// Header carrying how many times the dispatcher may redeliver.
pub const RETRIES_HEADER: &str = "x-queue-retries";
/// Header the dispatcher sets on redeliveries, counting previous attempts.
pub const RETRIED_HEADER: &str = "x-queue-retried";
/// Authorization the dispatcher forwards verbatim to the target.
pub const FORWARD_AUTH_HEADER: &str = "x-queue-forward-authorization";

/// Body delivered to the worker endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub job_id: Uuid,
    pub session_id: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub reference_image_urls: Vec<String>,
    #[serde(default)]
    pub original_request_body: Value,
    #[serde(default)]
    pub caller_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is misconfigured: {0}")]
    Misconfigured(String),
    #[error("queue rejected the message: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("queue request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("queue is shut down")]
    Closed,
}

/// At-least-once delivery of worker payloads to `target_url`, one at a time.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, target_url: &str, payload: &WorkerPayload) -> Result<(), QueueError>;
}

/// Publishes through an external HTTP dispatcher (`POST <endpoint>/publish/<target>`).
pub struct HttpQueue {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    retries: u32,
    worker_token: Option<String>,
}

impl HttpQueue {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token,
            retries: 3,
            worker_token: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Token the worker endpoint expects; forwarded with every delivery.
    pub fn with_worker_token(mut self, token: Option<String>) -> Self {
        self.worker_token = token;
        self
    }
}

#[async_trait]
impl JobQueue for HttpQueue {
    #[instrument(skip(self, payload), fields(job_id = %payload.job_id))]
    async fn publish(&self, target_url: &str, payload: &WorkerPayload) -> Result<(), QueueError> {
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| QueueError::Misconfigured("no queue token configured".into()))?;

        let url = format!("{}/publish/{target_url}", self.endpoint.trim_end_matches('/'));
        let mut request = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(PARALLELISM_HEADER, "1")
            .header(RETRIES_HEADER, self.retries.to_string())
            .json(payload);
        if let Some(worker_token) = &self.worker_token {
            request = request.header(FORWARD_AUTH_HEADER, format!("Bearer {worker_token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QueueError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        debug!(message = "Published job", target = target_url);
        Ok(())
    }
}
