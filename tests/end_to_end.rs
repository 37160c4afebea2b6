use axum::{
    http::header::CONTENT_TYPE,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use photojob::api::{self, AppState, IDEMPOTENCY_HEADER, SCAVENGER_SECRET_HEADER};
use photojob::db::{JobStore, MemoryStore};
use photojob::provider::{ProviderAdapter, ProviderConfig};
use photojob::scavenger::Scavenger;
use photojob::server;
use photojob::storage::MemoryObjectStore;
use photojob::submit::Submitter;
use photojob::worker::{JobRunner, WorkerConfig};

const PUBLIC_BASE: &str = "https://cdn.test/media";

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

async fn spawn_router(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// Image host and generation API in one: `/images/source.png` serves a real
/// PNG, any other path is a 404, and every model call answers
/// with one inline image.
fn upstream() -> Router {
    let source = png(64, 48);
    let generated = BASE64.encode(png(32, 32));
    Router::new()
        .route(
            "/images/source.png",
            get(move || {
                let source = source.clone();
                async move { ([(CONTENT_TYPE, "image/png")], source) }
            }),
        )
        .route(
            "/v1beta/models/:call",
            post(move || {
                let generated = generated.clone();
                async move {
                    Json(json!({
                        "candidates": [{
                            "content": { "parts": [
                                { "text": "here you go" },
                                { "inlineData": { "mimeType": "image/png", "data": generated } }
                            ]},
                            "finishReason": "STOP"
                        }]
                    }))
                }
            }),
        )
}

struct TestServer {
    base_url: String,
    upstream_url: String,
    objects: Arc<MemoryObjectStore>,
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    async fn spawn(scavenger_secret: Option<&str>) -> Self {
        let (upstream_url, upstream_handle) = spawn_router(upstream()).await;

        let http = reqwest::Client::new();
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new(PUBLIC_BASE));
        let generator = Arc::new(ProviderAdapter::new(
            http.clone(),
            ProviderConfig {
                api_base: format!("{upstream_url}/v1beta"),
                api_key: Some("test-key".into()),
                fetch_timeout: Duration::from_secs(5),
                request_timeout: Duration::from_secs(5),
                ..ProviderConfig::default()
            },
        ));
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            generator,
            objects.clone(),
            http,
            WorkerConfig::default(),
        ));

        let cancel = CancellationToken::new();
        let (queue, queue_handle) = server::spawn(cancel.clone(), runner.clone(), 2, 3);
        let submitter = Arc::new(Submitter::new(
            store.clone(),
            Arc::new(queue),
            "http://unused/worker/generate",
        ));
        let state = Arc::new(AppState {
            scavenger: Arc::new(Scavenger::new(store.clone())),
            store,
            submitter,
            runner,
            worker_token: None,
            scavenger_secret: scavenger_secret.map(str::to_string),
        });
        let (base_url, api_handle) = spawn_router(api::router(state)).await;

        Self {
            base_url,
            upstream_url,
            objects,
            cancel,
            handles: vec![
                upstream_handle,
                api_handle,
                tokio::spawn(async move {
                    let _ = queue_handle.await;
                }),
            ],
        }
    }

    async fn submit(&self, client: &reqwest::Client, body: Value) -> Value {
        let res = client
            .post(format!("{}/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        res.json().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn finished_job(client: &reqwest::Client, base_url: &str, id: &str) -> Value {
    for _ in 0..200 {
        let job: Value = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if job["status"] == "completed" || job["status"] == "failed" {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} did not finish in time");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn(None).await;
    let body: Value = reqwest::get(format!("{}/health", srv.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn submitted_job_completes_and_result_is_stored() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();

    let accepted = srv
        .submit(
            &client,
            json!({
                "imageUrl": format!("{}/images/source.png", srv.upstream_url),
                "prompt": "make it brighter",
                "resolution": "2K",
                "sessionId": "session-1",
            }),
        )
        .await;
    assert_eq!(accepted["ok"], true);
    assert_eq!(accepted["status"], "processing");
    assert_eq!(accepted["sessionId"], "session-1");
    assert!(accepted["seed"].is_u64());

    let job = finished_job(&client, &srv.base_url, accepted["jobId"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed", "job: {job}");
    assert!(job["error"].is_null());

    let result_url = job["resultUrl"].as_str().unwrap();
    assert!(result_url.starts_with(PUBLIC_BASE));
    let key = srv.objects.key_for_url(result_url).unwrap();
    assert!(key.starts_with("private/session-1/"));
    let object = srv.objects.object(key).await.unwrap();
    assert_eq!(object.content_type, "image/png");
    assert!(!object.bytes.is_empty());

    let steps: Vec<&str> = job["steps"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|step| step["name"].as_str())
        .collect();
    assert_eq!(steps.first(), Some(&"processing"));
    assert_eq!(steps.last(), Some(&"completed"));
}

#[tokio::test]
async fn unreachable_source_image_fails_the_job() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();

    let accepted = srv
        .submit(
            &client,
            json!({
                "imageUrl": format!("{}/images/missing.png", srv.upstream_url),
                "prompt": "anything",
            }),
        )
        .await;

    let job = finished_job(&client, &srv.base_url, accepted["jobId"].as_str().unwrap()).await;
    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().unwrap().contains("404"), "job: {job}");
    assert!(job["resultUrl"].is_null());
    assert!(srv.objects.keys().await.is_empty());
}

#[tokio::test]
async fn idempotency_key_replays_the_first_job() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();
    let body = json!({ "prompt": "a red bicycle", "seed": 7 });

    let mut ids = vec![];
    for _ in 0..2 {
        let res: Value = client
            .post(format!("{}/generate", srv.base_url))
            .header(IDEMPOTENCY_HEADER, "order-42")
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        ids.push(res["jobId"].as_str().unwrap().to_string());
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn invalid_submission_is_rejected() {
    let srv = TestServer::spawn(None).await;
    let res = reqwest::Client::new()
        .post(format!("{}/generate", srv.base_url))
        .json(&json!({ "prompt": "x", "strength": 3.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn scavenger_requires_the_configured_secret() {
    let client = reqwest::Client::new();

    let unconfigured = TestServer::spawn(None).await;
    let res = client
        .post(format!("{}/scavenger", unconfigured.base_url))
        .header(SCAVENGER_SECRET_HEADER, "anything")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let srv = TestServer::spawn(Some("s3cret")).await;
    let res = client
        .post(format!("{}/scavenger", srv.base_url))
        .header(SCAVENGER_SECRET_HEADER, "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/scavenger", srv.base_url))
        .header(SCAVENGER_SECRET_HEADER, "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["cleanedCount"], 0);
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();
    let id = uuid::Uuid::new_v4();

    let res = client.get(format!("{}/jobs/{}", srv.base_url, id)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.delete(format!("{}/jobs/{}", srv.base_url, id)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
