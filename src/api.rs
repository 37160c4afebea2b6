//! HTTP surface: submission, worker callback, scavenger trigger and job reads.

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, warn};
use uuid::Uuid;

use crate::db::JobStore;
use crate::metadata::Step;
use crate::queue::{WorkerPayload, RETRIED_HEADER};
use crate::scavenger::Scavenger;
use crate::submit::{SubmitError, SubmitRequest, Submitter};
use crate::worker::{JobRunner, RunOutcome};
use crate::{Job, JobChange, Status};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const USER_HEADER: &str = "x-user-id";
pub const SCAVENGER_SECRET_HEADER: &str = "x-scavenger-secret";

/// Everything the handlers need, built once at startup.
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub submitter: Arc<Submitter>,
    pub runner: Arc<JobRunner>,
    pub scavenger: Arc<Scavenger>,
    /// When set, `POST /worker/generate` requires this bearer token.
    pub worker_token: Option<String>,
    /// When unset, the scavenger endpoint rejects every call.
    pub scavenger_secret: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/worker/generate", post(worker_generate))
        .route("/scavenger", get(scavenge).post(scavenge))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/events", get(job_events))
        .layer(Extension(state))
}

/// What clients see of a job. Like every other response body it is camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub status: Status,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub session_id: Option<String>,
    pub seed: Option<u32>,
    pub steps: Vec<StepView>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub name: String,
    pub start_time: DateTime<Utc>,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            name: step.name.clone(),
            start_time: step.start_time,
        }
    }
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let meta = job.metadata();
        Self {
            id: job.id,
            status: job.status,
            result_url: job.result_url.clone(),
            error: job.error.clone(),
            error_code: job.error_code.clone(),
            session_id: meta.session_id.clone(),
            seed: meta.params.as_ref().map(|p| p.seed),
            steps: meta.steps.iter().map(StepView::from).collect(),
            created_at: job.created_at,
            started_at: job.started_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "ok": false,
            "error": message.into(),
            "code": code,
        })),
    )
        .into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    header(headers, AUTHORIZATION.as_str()).and_then(|value| value.strip_prefix("Bearer "))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn generate(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let original: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_body", format!("invalid JSON body: {err}"))
        }
    };
    let request: SubmitRequest = match serde_json::from_value(original.clone()) {
        Ok(request) => request,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, "invalid_body", err.to_string()),
    };
    let caller = header(&headers, USER_HEADER).map(str::to_string);
    let key = header(&headers, IDEMPOTENCY_HEADER).map(str::to_string);

    match state.submitter.submit(request, original, caller, key).await {
        Ok(submission) => Json(json!({
            "ok": true,
            "jobId": submission.job_id,
            "sessionId": submission.session_id,
            "status": submission.status,
            "seed": submission.seed,
            "reused": submission.reused,
        }))
        .into_response(),
        Err(SubmitError::Validation(message)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        Err(SubmitError::Store(err)) => {
            error!(message = "Submission failed", error = %err);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
        Err(err @ SubmitError::Dispatch { job_id, .. }) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "ok": false,
                "error": err.to_string(),
                "code": crate::codes::DISPATCH_FAILED,
                "jobId": job_id,
            })),
        )
            .into_response(),
    }
}

async fn worker_generate(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(token) = &state.worker_token {
        if bearer(&headers) != Some(token.as_str()) {
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid worker token");
        }
    }
    let payload: WorkerPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, "invalid_body", err.to_string()),
    };
    let delivery = header(&headers, RETRIED_HEADER)
        .and_then(|value| value.parse::<u32>().ok())
        .map_or(1, |retried| retried.saturating_add(1));

    match state.runner.run(&payload, delivery).await {
        Ok(RunOutcome::Completed { result_url }) => {
            Json(json!({ "ok": true, "status": Status::Completed, "resultUrl": result_url })).into_response()
        }
        Ok(RunOutcome::Failed { error }) => {
            Json(json!({ "ok": false, "status": Status::Failed, "error": error })).into_response()
        }
        Ok(RunOutcome::Skipped(status)) => {
            Json(json!({ "ok": true, "skipped": true, "status": status })).into_response()
        }
        // the failure could not be recorded; a non-2xx lets the queue redeliver
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    }
}

async fn scavenge(Extension(state): Extension<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(secret) = state.scavenger_secret.as_deref().filter(|s| !s.is_empty()) else {
        warn!("Scavenger called but no secret is configured");
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "scavenger is not configured");
    };
    let presented = header(&headers, SCAVENGER_SECRET_HEADER).or_else(|| bearer(&headers));
    if presented != Some(secret) {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid scavenger secret");
    }

    match state.scavenger.sweep().await {
        Ok(report) => Json(json!({
            "ok": true,
            "cleanedCount": report.cleaned_count,
            "candidates": report.candidates,
            "durationMs": report.duration_ms,
        }))
        .into_response(),
        Err(err) => {
            error!(message = "Sweep failed", error = %err);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

async fn get_job(Extension(state): Extension<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.store.get(id).await {
        Ok(Some(job)) => Json(JobView::from(&job)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    }
}

async fn delete_job(Extension(state): Extension<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.store.delete(&[id]).await {
        Ok(0) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    }
}

async fn job_events(Extension(state): Extension<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    // subscribe before reading so no change between the two is missed
    let changes = state.store.subscribe();
    let current = match state.store.get(id).await {
        Ok(Some(job)) => JobView::from(&job),
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    };
    Sse::new(job_stream(state.store.clone(), id, current, changes))
        .keep_alive(KeepAlive::default())
        .into_response()
}

struct Watch {
    store: Arc<dyn JobStore>,
    id: Uuid,
    changes: broadcast::Receiver<JobChange>,
    initial: Option<JobView>,
    done: bool,
}

fn job_event(view: &JobView) -> SseEvent {
    SseEvent::default()
        .event("job")
        .data(serde_json::to_string(view).unwrap_or_default())
}

fn deleted_event(id: Uuid) -> SseEvent {
    SseEvent::default().event("deleted").data(id.to_string())
}

/// The current view, then one event per change, ending after a terminal
/// status or deletion.
fn job_stream(
    store: Arc<dyn JobStore>,
    id: Uuid,
    current: JobView,
    changes: broadcast::Receiver<JobChange>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let watch = Watch {
        store,
        id,
        changes,
        initial: Some(current),
        done: false,
    };
    stream::unfold(watch, |mut watch| async move {
        if watch.done {
            return None;
        }
        if let Some(view) = watch.initial.take() {
            watch.done = view.status.is_terminal();
            return Some((Ok(job_event(&view)), watch));
        }
        loop {
            match watch.changes.recv().await {
                Ok(change) if change.id != watch.id => continue,
                Ok(change) if change.deleted => {
                    watch.done = true;
                    return Some((Ok(deleted_event(watch.id)), watch));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
            let event = match watch.store.get(watch.id).await {
                Ok(Some(job)) => {
                    watch.done = job.status.is_terminal();
                    job_event(&JobView::from(&job))
                }
                Ok(None) => {
                    watch.done = true;
                    deleted_event(watch.id)
                }
                Err(err) => {
                    warn!(message = "Job watch failed", job_id = %watch.id, error = %err);
                    watch.done = true;
                    SseEvent::default().event("error").data(err.to_string())
                }
            };
            return Some((Ok(event), watch));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobUpdate, MemoryStore};
    use crate::{ExecutionMetadata, NewJob};
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_ends_after_terminal_status() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .insert(NewJob {
                input_url: None,
                prompt: Some("a cat".into()),
                category: None,
                user_id: None,
                execution_metadata: ExecutionMetadata::default(),
            })
            .await
            .unwrap();
        let changes = store.subscribe();
        let stream = job_stream(store.clone(), job.id, JobView::from(&job), changes);

        store
            .transition(
                job.id,
                &[Status::Processing],
                JobUpdate::advance(Status::Generating, ExecutionMetadata::default()),
            )
            .await
            .unwrap();
        store
            .transition(
                job.id,
                &Status::ACTIVE,
                JobUpdate::completed("http://cdn/x.png".into(), ExecutionMetadata::default()),
            )
            .await
            .unwrap();

        // both changes are queued before the first poll, so the second
        // event already reads the completed row and closes the stream
        let events: Vec<_> = tokio::time::timeout(std::time::Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn view_exposes_steps_and_seed() {
        let now = Utc::now();
        let mut meta = ExecutionMetadata::default();
        meta.record_step("processing");
        let job = Job {
            id: Uuid::new_v4(),
            status: Status::Processing,
            input_url: None,
            prompt: None,
            category: None,
            user_id: None,
            result_url: None,
            error: None,
            error_code: None,
            execution_metadata: sqlx::types::Json(meta),
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        };
        let value = serde_json::to_value(JobView::from(&job)).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["steps"][0]["name"], "processing");
        assert!(value["steps"][0]["startTime"].is_string());
        assert!(value["resultUrl"].is_null());
        assert!(value["errorCode"].is_null());
        assert!(value["createdAt"].is_string());
        assert!(value.get("result_url").is_none());
    }
}
