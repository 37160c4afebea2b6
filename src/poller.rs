//! Client side: submit a job over HTTP and poll until it finishes.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::api::{JobView, IDEMPOTENCY_HEADER};
use crate::submit::SubmitRequest;

/// Poll cadence: dense at first, sparser later, bounded overall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    /// `(attempts, interval)` tiers used in order, then `tail` forever.
    pub tiers: Vec<(u32, Duration)>,
    pub tail: Duration,
    pub timeout: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![(10, Duration::from_secs(1)), (10, Duration::from_secs(3))],
            tail: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl PollSchedule {
    /// Wait before poll number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut remaining = attempt;
        for (count, interval) in &self.tiers {
            if remaining < *count {
                return *interval;
            }
            remaining -= count;
        }
        self.tail
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("job {0} did not finish within {1:?}")]
    TimedOut(Uuid, Duration),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub session_id: String,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub reused: bool,
}

pub struct JobClient {
    http: reqwest::Client,
    base_url: String,
    schedule: PollSchedule,
}

async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    ClientError::Api { status, message }
}

impl JobClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            schedule: PollSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub async fn submit(
        &self,
        request: &SubmitRequest,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitResponse, ClientError> {
        let mut builder = self.http.post(format!("{}/generate", self.base_url)).json(request);
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<JobView, ClientError> {
        let response = self
            .http
            .get(format!("{}/jobs/{id}", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Polls on the schedule until the job is completed or failed.
    pub async fn wait_for_terminal(&self, id: Uuid) -> Result<JobView, ClientError> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let view = self.get(id).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            let delay = self.schedule.delay(attempt);
            if started.elapsed() + delay > self.schedule.timeout {
                return Err(ClientError::TimedOut(id, self.schedule.timeout));
            }
            debug!(message = "Job still running", job_id = %id, status = %view.status, attempt);
            sleep(delay).await;
            attempt += 1;
        }
    }
}
