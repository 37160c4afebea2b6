//! Generation provider adapter.
//!
//! [`ProviderAdapter`] turns a [`GenerationRequest`] into a [`GenerationResult`]
//! by calling an external image model over HTTP. Expected failures (provider
//! errors, timeouts, policy blocks) come back as [`GenerationResult::Failure`];
//! only misconfiguration is an `Err`, and it is reported before any network call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub mod aspect;
pub mod imaging;
pub mod payload;
pub mod response;
pub mod retry;

use aspect::AspectMode;
use imaging::PreparedImage;
use payload::{ModelShape, PayloadInput};
use response::{ExtractedImage, ProviderResponse};
use retry::{with_retry, ErrorKind, ProviderError, RetryPolicy, RetryStats};

/// Output size tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "1K", alias = "1k")]
    OneK,
    #[serde(rename = "2K", alias = "2k")]
    TwoK,
    #[serde(rename = "4K", alias = "4k")]
    FourK,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::OneK => "1K",
            Resolution::TwoK => "2K",
            Resolution::FourK => "4K",
        }
    }

    fn scale(self) -> u32 {
        match self {
            Resolution::OneK => 1,
            Resolution::TwoK => 2,
            Resolution::FourK => 4,
        }
    }

    /// Upscale factor needed to get from `native` to `self`, if any.
    pub fn upscale_factor_from(self, native: Resolution) -> Option<u32> {
        (self > native).then(|| self.scale() / native.scale())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(Resolution::OneK),
            "2K" => Ok(Resolution::TwoK),
            "4K" => Ok(Resolution::FourK),
            other => Err(format!("unknown resolution '{other}', expected 1K, 2K or 4K")),
        }
    }
}

/// Normalized arguments for one generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub image_url: Option<String>,
    pub prompt: String,
    pub strength: Option<f32>,
    pub resolution: Resolution,
    pub aspect_ratio: AspectMode,
    pub reference_image_urls: Vec<String>,
    pub seed: Option<u32>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    Bytes(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub payload: ImagePayload,
    pub mime_type: String,
    pub model: String,
    pub raw: Value,
    pub retries: RetryStats,
}

#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub error: String,
    pub raw: Value,
    pub retries: RetryStats,
}

#[derive(Debug, Clone)]
pub enum GenerationResult {
    Success(GeneratedImage),
    Failure(GenerationFailure),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("provider is misconfigured: {0}")]
    Misconfigured(String),
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
    pub upscale_model: String,
    /// Long edge that source and reference images are shrunk to before upload.
    pub max_edge: u32,
    pub request_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta".into(),
            api_key: None,
            default_model: None,
            upscale_model: payload::DEFAULT_UPSCALE_MODEL.into(),
            max_edge: 768,
            request_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ProviderAdapter {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderAdapter {
    pub fn new(client: reqwest::Client, config: ProviderConfig) -> Self {
        Self { client, config }
    }

    fn api_key(&self) -> Result<&str, AdapterError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AdapterError::Misconfigured("no provider API key configured".into()))
    }

    /// One POST, with the per-request timeout clipped to what is left of the
    /// overall budget.
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        api_key: &str,
        started: Instant,
    ) -> Result<Value, ProviderError> {
        let remaining = self.config.retry.remaining(started);
        if remaining.is_zero() {
            return Err(ProviderError::new(
                ErrorKind::Deadline,
                format!("no time left to call {url}"),
            ));
        }

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .timeout(self.config.request_timeout.min(remaining))
            .json(body)
            .send()
            .await
            .map_err(|err| ProviderError::transport("provider request failed", &err))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::transport("provider response was cut off", &err))?;
        if !status.is_success() {
            return Err(ProviderError::http(status.as_u16(), "provider returned an error", text));
        }
        serde_json::from_str(&text).map_err(|err| {
            ProviderError::new(
                ErrorKind::Transient,
                format!("provider returned malformed JSON: {err}"),
            )
            .with_raw(Value::String(text))
        })
    }

    async fn prepare_image(
        &self,
        url: &str,
        started: Instant,
        stats: &mut RetryStats,
    ) -> Result<PreparedImage, ProviderError> {
        let client = &self.client;
        let timeout = self.config.fetch_timeout;
        let max_edge = self.config.max_edge;
        with_retry(&self.config.retry, started, stats, "fetch image", move || {
            imaging::fetch_prepared(client, url, timeout, max_edge)
        })
        .await
    }

    async fn try_generate(
        &self,
        request: &GenerationRequest,
        api_key: &str,
        started: Instant,
        stats: &mut RetryStats,
    ) -> Result<(ExtractedImage, String, Value), ProviderError> {
        let model = payload::select_model(request.model.as_deref(), self.config.default_model.as_deref());
        let shape = ModelShape::for_model(&model);

        let source = match &request.image_url {
            Some(url) => Some(self.prepare_image(url, started, stats).await?),
            None => None,
        };

        let mut references = Vec::new();
        if request.reference_image_urls.len() > payload::MAX_REFERENCE_IMAGES {
            warn!(
                message = "Dropping extra reference images",
                given = request.reference_image_urls.len(),
                kept = payload::MAX_REFERENCE_IMAGES,
            );
        }
        for url in request.reference_image_urls.iter().take(payload::MAX_REFERENCE_IMAGES) {
            match self.prepare_image(url, started, stats).await {
                Ok(image) => references.push(image),
                Err(err) => warn!(message = "Skipping reference image", url = %url, error = %err),
            }
        }

        let aspect_ratio = request.aspect_ratio.resolve(
            source.as_ref().map(PreparedImage::source_dimensions),
            shape.supported_ratios(),
        );
        let seed = request.seed.unwrap_or_else(rand::random);
        let body = payload::build(
            shape,
            &PayloadInput {
                prompt: &request.prompt,
                source: source.as_ref(),
                references: &references,
                aspect_ratio,
                resolution: request.resolution,
                seed,
                strength: request.strength,
            },
        );
        let url = payload::endpoint(&self.config.api_base, &model, shape.method());
        debug!(message = "Calling provider", model = %model, aspect_ratio = %aspect_ratio);

        let (url, body) = (url.as_str(), &body);
        let raw = with_retry(&self.config.retry, started, stats, "generate", move || {
            self.post_json(url, body, api_key, started)
        })
        .await?;

        let parsed = ProviderResponse::parse(shape, &raw).map_err(|err| {
            ProviderError::new(
                ErrorKind::Rejected,
                format!("unexpected provider response: {err}"),
            )
            .with_raw(raw.clone())
        })?;
        let image = parsed
            .first_image()
            .map_err(|reason| ProviderError::new(ErrorKind::Blocked, reason).with_raw(raw.clone()))?;

        let image = match request.resolution.upscale_factor_from(shape.native_resolution()) {
            Some(factor) => self.upscale(image, factor, api_key, started, stats).await,
            None => image,
        };
        Ok((image, model, raw))
    }

    /// Best effort: any failure returns `image` unchanged.
    async fn upscale(
        &self,
        image: ExtractedImage,
        factor: u32,
        api_key: &str,
        started: Instant,
        stats: &mut RetryStats,
    ) -> ExtractedImage {
        let bytes = match &image.payload {
            ImagePayload::Bytes(bytes) => bytes.clone(),
            ImagePayload::Url(url) => {
                match imaging::fetch(&self.client, url, self.config.fetch_timeout).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(message = "Upscale skipped, result not fetchable", error = %err);
                        return image;
                    }
                }
            }
        };

        let body = payload::build_upscale(&bytes, factor);
        let url = payload::endpoint(&self.config.api_base, &self.config.upscale_model, "predict");
        let (url, body) = (url.as_str(), &body);
        let raw = match with_retry(&self.config.retry, started, stats, "upscale", move || {
            self.post_json(url, body, api_key, started)
        })
        .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(message = "Upscale failed, keeping original", error = %err);
                return image;
            }
        };

        match ProviderResponse::parse(ModelShape::Instances, &raw)
            .map_err(|err| err.to_string())
            .and_then(|parsed| parsed.first_image())
        {
            Ok(upscaled) => {
                info!(message = "Upscaled result", factor);
                upscaled
            }
            Err(reason) => {
                warn!(message = "Upscale returned no image, keeping original", reason = %reason);
                image
            }
        }
    }
}

#[async_trait]
impl Generator for ProviderAdapter {
    #[instrument(name = "provider.generate", skip_all)]
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, AdapterError> {
        let api_key = self.api_key()?;
        let started = Instant::now();
        let mut stats = RetryStats::default();

        let result = self.try_generate(request, api_key, started, &mut stats).await;
        Ok(match result {
            Ok((image, model, raw)) => {
                info!(
                    message = "Generation succeeded",
                    model = %model,
                    attempts = stats.attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                );
                GenerationResult::Success(GeneratedImage {
                    payload: image.payload,
                    mime_type: image.mime_type,
                    model,
                    raw,
                    retries: stats,
                })
            }
            Err(err) => {
                warn!(message = "Generation failed", error = %err, attempts = stats.attempts);
                GenerationResult::Failure(GenerationFailure {
                    error: err.message,
                    raw: err.raw,
                    retries: stats,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode, routing::post, Json, Router};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1beta")
    }

    fn adapter(api_base: String) -> ProviderAdapter {
        ProviderAdapter::new(
            reqwest::Client::new(),
            ProviderConfig {
                api_base,
                api_key: Some("test-key".into()),
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                    rate_limit_delay: Duration::from_millis(20),
                    deadline: Duration::from_secs(10),
                },
                ..ProviderConfig::default()
            },
        )
    }

    fn inline_image(bytes: &[u8]) -> Value {
        json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(bytes) } }
            ]}}]
        })
    }

    #[test]
    fn resolution_parsing_and_order() {
        assert_eq!("2k".parse::<Resolution>().unwrap(), Resolution::TwoK);
        assert!("8K".parse::<Resolution>().is_err());
        assert!(Resolution::FourK > Resolution::TwoK);
        assert_eq!(serde_json::to_value(Resolution::FourK).unwrap(), "4K");
        assert_eq!(
            serde_json::from_value::<Resolution>(serde_json::json!("2k")).unwrap(),
            Resolution::TwoK
        );
    }

    #[test]
    fn upscale_factors() {
        assert_eq!(Resolution::OneK.upscale_factor_from(Resolution::OneK), None);
        assert_eq!(Resolution::TwoK.upscale_factor_from(Resolution::OneK), Some(2));
        assert_eq!(Resolution::FourK.upscale_factor_from(Resolution::OneK), Some(4));
        assert_eq!(Resolution::FourK.upscale_factor_from(Resolution::TwoK), Some(2));
        assert_eq!(Resolution::OneK.upscale_factor_from(Resolution::TwoK), None);
    }

    #[tokio::test]
    async fn missing_key_fails_fast() {
        let adapter = ProviderAdapter::new(reqwest::Client::new(), ProviderConfig::default());
        let request = GenerationRequest {
            image_url: Some("http://127.0.0.1:1/never-fetched.jpg".into()),
            prompt: "enhance".into(),
            ..Default::default()
        };
        let err = adapter.generate(&request).await.unwrap_err();
        assert!(matches!(err, AdapterError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn failed_upscale_keeps_the_original() {
        let upscale_calls = Arc::new(AtomicU32::new(0));
        let calls = upscale_calls.clone();
        let app = Router::new().route(
            "/v1beta/models/:call",
            post(move |Path(call): Path<String>| {
                let calls = calls.clone();
                async move {
                    if call.ends_with(":predict") {
                        calls.fetch_add(1, Ordering::SeqCst);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({ "error": { "message": "upscaler down" } })),
                        )
                    } else {
                        (StatusCode::OK, Json(inline_image(b"orig")))
                    }
                }
            }),
        );
        let adapter = adapter(serve(app).await);

        let request = GenerationRequest {
            prompt: "a lighthouse".into(),
            resolution: Resolution::FourK,
            ..Default::default()
        };
        let image = match adapter.generate(&request).await.unwrap() {
            GenerationResult::Success(image) => image,
            GenerationResult::Failure(failure) => panic!("expected success, got {}", failure.error),
        };
        assert_eq!(image.payload, ImagePayload::Bytes(b"orig".to_vec()));
        // the 500 is retried up to the attempt limit before giving up
        assert_eq!(upscale_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rate_limited_call_is_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1beta/models/:call",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            StatusCode::TOO_MANY_REQUESTS,
                            Json(json!({ "error": { "status": "RESOURCE_EXHAUSTED", "message": "quota" } })),
                        )
                    } else {
                        (StatusCode::OK, Json(inline_image(b"second try")))
                    }
                }
            }),
        );
        let adapter = adapter(serve(app).await);

        let request = GenerationRequest {
            prompt: "a lighthouse".into(),
            ..Default::default()
        };
        let image = match adapter.generate(&request).await.unwrap() {
            GenerationResult::Success(image) => image,
            GenerationResult::Failure(failure) => panic!("expected success, got {}", failure.error),
        };
        assert_eq!(image.payload, ImagePayload::Bytes(b"second try".to_vec()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(image.retries.attempts, 2);
        assert_eq!(image.retries.rate_limit_cooldowns, 1);
    }

    #[tokio::test]
    async fn rejected_call_is_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1beta/models/:call",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "error": { "message": "prompt too long" } })),
                    )
                }
            }),
        );
        let adapter = adapter(serve(app).await);

        let request = GenerationRequest {
            prompt: "a lighthouse".into(),
            ..Default::default()
        };
        match adapter.generate(&request).await.unwrap() {
            GenerationResult::Failure(failure) => {
                assert!(failure.error.contains("HTTP 400"), "{}", failure.error);
                assert!(failure.error.contains("prompt too long"));
            }
            GenerationResult::Success(_) => panic!("expected failure"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
