//! The `execution_metadata` document stored on every job.
//!
//! The document is additive: writers merge into what is already stored and the
//! `steps` log only ever grows. Unknown keys written by other versions survive
//! a round trip through `extra`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::provider::Resolution;

pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<GenerationParams>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub retries: RetryCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn current_version() -> u32 {
    METADATA_VERSION
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            idempotency_key: None,
            fingerprint: None,
            session_id: None,
            callback_url: None,
            diagnostics: Diagnostics::default(),
            params: None,
            steps: Vec::new(),
            retries: RetryCounters::default(),
            timings: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// How many times the queue has handed this job to a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliveries: Option<u32>,
}

/// Generation parameters captured at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub seed: u32,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
    #[serde(default)]
    pub reference_image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub attempts: u32,
    pub rate_limit_cooldowns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub total_duration_ms: u64,
}

impl ExecutionMetadata {
    /// Appends a step entry stamped with the current time.
    pub fn record_step(&mut self, name: &str) {
        self.record_step_at(name, Utc::now());
    }

    pub fn record_step_at(&mut self, name: &str, start_time: DateTime<Utc>) {
        self.steps.push(Step {
            name: name.to_string(),
            start_time,
        });
    }

    pub fn last_step(&self) -> Option<&str> {
        self.steps.last().map(|step| step.name.as_str())
    }

    /// Folds `newer` into `self`.
    ///
    /// Scalar fields take the newer value when it is set, counters keep the
    /// larger value, and steps from both sides are kept in time order with
    /// exact duplicates dropped.
    pub fn merge(&mut self, newer: &ExecutionMetadata) {
        self.version = self.version.max(newer.version);
        merge_option(&mut self.idempotency_key, &newer.idempotency_key);
        merge_option(&mut self.fingerprint, &newer.fingerprint);
        merge_option(&mut self.session_id, &newer.session_id);
        merge_option(&mut self.callback_url, &newer.callback_url);
        merge_option(&mut self.diagnostics.queue, &newer.diagnostics.queue);
        merge_option(&mut self.diagnostics.host, &newer.diagnostics.host);
        self.diagnostics.deliveries = self.diagnostics.deliveries.max(newer.diagnostics.deliveries);
        merge_option(&mut self.params, &newer.params);
        merge_option(&mut self.timings, &newer.timings);

        self.retries.attempts = self.retries.attempts.max(newer.retries.attempts);
        self.retries.rate_limit_cooldowns = self
            .retries
            .rate_limit_cooldowns
            .max(newer.retries.rate_limit_cooldowns);

        for step in &newer.steps {
            if !self.steps.contains(step) {
                self.steps.push(step.clone());
            }
        }
        self.steps.sort_by_key(|step| step.start_time);

        for (key, value) in &newer.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

fn merge_option<T: Clone>(current: &mut Option<T>, newer: &Option<T>) {
    if newer.is_some() {
        current.clone_from(newer);
    }
}
