use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Cache directive for generated results; keys are never reused.
pub const IMMUTABLE_CACHE: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("object store request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct PutOptions<'a> {
    pub content_type: &'a str,
    pub cache_control: Option<&'a str>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, options: PutOptions<'_>) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Public URL the object is served from once written.
    fn public_url(&self, key: &str) -> String;
}

/// `private/<session>/<purpose>/<id>-<timestamp>.<ext>`
pub fn storage_key(session: &str, purpose: &str, id: &str, timestamp_ms: i64, ext: &str) -> String {
    format!(
        "private/{}/{}/{}-{timestamp_ms}.{ext}",
        sanitize(session),
        sanitize(purpose),
        sanitize(id)
    )
}

fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "anonymous".into()
    } else {
        cleaned
    }
}

pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type.split(';').next().unwrap_or("").trim() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{key}", base.trim_end_matches('/'))
}

/// Objects written under a directory, served by something else at `public_base`.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _options: PutOptions<'_>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(message = "Stored object", path = %path.display());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base, key)
    }
}

/// A bucket behind an HTTP object API (`/object/<bucket>/<key>`).
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: String,
    public_base: String,
}

impl HttpObjectStore {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: impl Into<String>,
        public_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            token: token.into(),
            public_base: public_base.into(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/object/{}/{key}",
            self.endpoint.trim_end_matches('/'),
            self.bucket
        )
    }
}

async fn check(response: reqwest::Response, key: &str) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(key.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(StorageError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(skip(self, bytes, options), fields(bucket = %self.bucket, size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, options: PutOptions<'_>) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut request = self
            .client
            .put(self.object_url(key))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, options.content_type)
            .header("x-upsert", "true")
            .body(bytes);
        if let Some(cache_control) = options.cache_control {
            request = request.header(CACHE_CONTROL, cache_control);
        }
        check(request.send().await?, key).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        let response = self
            .client
            .get(self.object_url(key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let bytes = check(response, key).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base, key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub cache_control: Option<String>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    public_base: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            public_base: public_base.into(),
            objects: RwLock::default(),
        }
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Inverse of [`ObjectStore::public_url`].
    pub fn key_for_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.public_base.trim_end_matches('/'))
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, options: PutOptions<'_>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: options.content_type.to_string(),
                cache_control: options.cache_control.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base, key)
    }
}
