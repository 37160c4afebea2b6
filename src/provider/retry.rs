//! Bounded retry with deadline-aware backoff for outbound provider calls.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::metadata::RetryCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 429 or a quota-exhausted body.
    RateLimited,
    /// 5xx, "server busy", timeouts and dropped connections.
    Transient,
    /// Anything the provider will keep rejecting: bad request, auth, 404.
    Rejected,
    /// The call finished but no image came back, usually a policy block.
    Blocked,
    /// Our own deadline ran out before the call could succeed.
    Deadline,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Transient)
    }

    /// Classifies a non-success HTTP response.
    pub fn classify(status: u16, body: &str) -> Self {
        let upper = body.to_ascii_uppercase();
        if status == 429 || upper.contains("RESOURCE_EXHAUSTED") || upper.contains("QUOTA") {
            ErrorKind::RateLimited
        } else if status >= 500 || upper.contains("UNAVAILABLE") || upper.contains("OVERLOADED") {
            ErrorKind::Transient
        } else {
            ErrorKind::Rejected
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub raw: Value,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            raw: Value::Null,
        }
    }

    pub fn http(status: u16, context: &str, body: String) -> Self {
        let kind = ErrorKind::classify(status, &body);
        let raw = serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body.clone()));
        let detail = provider_message(&raw).unwrap_or(body);
        Self {
            kind,
            status: Some(status),
            message: format!("{context}: HTTP {status}: {detail}"),
            raw,
        }
    }

    pub fn transport(context: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
            ErrorKind::Transient
        } else {
            ErrorKind::Rejected
        };
        Self::new(kind, format!("{context}: {err}"))
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Pulls `error.message` out of a JSON error body when there is one.
fn provider_message(raw: &Value) -> Option<String> {
    raw.get("error")
        .and_then(|err| err.get("message").or(Some(err)))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait before the first retry after a rate-limit error. Provider quotas
    /// are usually per minute, so this is much longer than `base_delay`.
    pub rate_limit_delay: Duration,
    /// Hard budget for the whole generation, measured from its start.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
            rate_limit_delay: Duration::from_secs(30),
            deadline: Duration::from_secs(240),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the retry following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn remaining(&self, started: Instant) -> Duration {
        self.deadline.saturating_sub(started.elapsed())
    }
}

/// Counters shared by every call made during one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u32,
    pub rate_limit_cooldowns: u32,
    saw_rate_limit: bool,
}

impl From<RetryStats> for RetryCounters {
    fn from(stats: RetryStats) -> Self {
        RetryCounters {
            attempts: stats.attempts,
            rate_limit_cooldowns: stats.rate_limit_cooldowns,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or the next wait would end past the policy deadline.
///
/// `started` is the start of the whole generation, not of this call, so
/// several calls in a row share one budget.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    started: Instant,
    stats: &mut RetryStats,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        stats.attempts += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!(message = "Non-retryable provider error", call = label, error = %err);
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            warn!(message = "Retry attempts exhausted", call = label, attempts = attempt);
            return Err(ProviderError {
                message: format!("{} (gave up after {attempt} attempts)", err.message),
                ..err
            });
        }

        let rate_limited = err.kind == ErrorKind::RateLimited;
        let delay = if rate_limited && !stats.saw_rate_limit {
            policy.rate_limit_delay
        } else {
            policy.backoff(attempt)
        };

        let elapsed = started.elapsed();
        if elapsed + delay > policy.deadline {
            warn!(
                message = "Retry would pass the deadline, giving up",
                call = label,
                elapsed_ms = elapsed.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
            );
            return Err(ProviderError {
                message: format!(
                    "{} (stopped retrying after {attempt} attempts, deadline of {}s reached)",
                    err.message,
                    policy.deadline.as_secs()
                ),
                ..err
            });
        }

        if rate_limited {
            stats.saw_rate_limit = true;
            stats.rate_limit_cooldowns += 1;
        }
        warn!(
            message = "Retrying provider call",
            call = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
        );
        sleep(delay).await;
    }
}
