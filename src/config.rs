use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::retry::RetryPolicy;
use crate::provider::{ProviderConfig, Resolution};
use crate::submit::SubmitRequest;
use crate::worker::WorkerConfig;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct ConfigContext {
    #[arg(long = "log-json", env = "LOG_JSON", global = true, help = "Log as JSON lines")]
    pub log_json: bool,

    #[arg(
        long = "jaeger-endpoint",
        env = "JAEGER_ENDPOINT",
        global = true,
        help = "Jaeger collector URL; tracing export is off when unset"
    )]
    pub jaeger_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Run the HTTP service
    Serve(ServeArgs),
    /// Submit a job to a running service
    Submit(SubmitArgs),
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct ServeArgs {
    #[arg(short = 'l', long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    #[arg(
        long = "app-url",
        env = "APP_URL",
        default_value = "http://127.0.0.1:8080",
        help = "Externally reachable base URL of this service, used for worker callbacks"
    )]
    pub app_url: String,

    #[arg(
        short = 'c',
        long = "database-url",
        env = "DATABASE_URL",
        help = "PostgreSQL Connection URL; jobs are kept in memory when unset"
    )]
    pub database_url: Option<String>,

    #[arg(long = "db-connections", env = "DB_CONNECTIONS", default_value = "5")]
    pub db_connections: u32,

    #[arg(
        long = "provider-api-base",
        env = "PROVIDER_API_BASE",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub provider_api_base: String,

    #[arg(long = "provider-api-key", env = "PROVIDER_API_KEY", hide_env_values = true)]
    pub provider_api_key: Option<String>,

    #[arg(long = "default-model", env = "DEFAULT_MODEL")]
    pub default_model: Option<String>,

    #[arg(long = "upscale-model", env = "UPSCALE_MODEL", default_value = "imagen-4.0-upscale-preview")]
    pub upscale_model: String,

    #[arg(long = "default-resolution", env = "DEFAULT_RESOLUTION", default_value = "1K")]
    pub default_resolution: Resolution,

    #[arg(long = "max-edge", env = "MAX_EDGE", default_value = "768")]
    pub max_edge: u32,

    #[arg(
        long = "provider-deadline-secs",
        env = "PROVIDER_DEADLINE_SECS",
        default_value = "240",
        help = "Budget for one generation including retries; keep below the worker's hosting limit"
    )]
    pub provider_deadline_secs: u64,

    #[arg(long = "request-timeout-secs", env = "REQUEST_TIMEOUT_SECS", default_value = "120")]
    pub request_timeout_secs: u64,

    #[arg(long = "fetch-timeout-secs", env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    pub fetch_timeout_secs: u64,

    #[arg(long = "upload-timeout-secs", env = "UPLOAD_TIMEOUT_SECS", default_value = "30")]
    pub upload_timeout_secs: u64,

    #[arg(long = "storage-dir", env = "STORAGE_DIR", help = "Write results under this directory")]
    pub storage_dir: Option<PathBuf>,

    #[arg(long = "storage-endpoint", env = "STORAGE_ENDPOINT", help = "HTTP object API base URL")]
    pub storage_endpoint: Option<String>,

    #[arg(long = "storage-bucket", env = "STORAGE_BUCKET", default_value = "media")]
    pub storage_bucket: String,

    #[arg(long = "storage-token", env = "STORAGE_TOKEN", hide_env_values = true)]
    pub storage_token: Option<String>,

    #[arg(
        long = "public-base-url",
        env = "PUBLIC_BASE_URL",
        default_value = "http://127.0.0.1:8080/media"
    )]
    pub public_base_url: String,

    #[arg(long = "backup-dir", env = "BACKUP_DIR", help = "Best-effort second copy of every result")]
    pub backup_dir: Option<PathBuf>,

    #[arg(
        long = "queue-url",
        env = "QUEUE_URL",
        help = "External dispatcher; jobs run in-process when unset"
    )]
    pub queue_url: Option<String>,

    #[arg(long = "queue-token", env = "QUEUE_TOKEN", hide_env_values = true)]
    pub queue_token: Option<String>,

    #[arg(long = "queue-name", env = "QUEUE_NAME", default_value = "generate")]
    pub queue_name: String,

    #[arg(long = "queue-retries", env = "QUEUE_RETRIES", default_value = "3")]
    pub queue_retries: u32,

    #[arg(
        long = "worker-token",
        env = "WORKER_TOKEN",
        hide_env_values = true,
        help = "Bearer token required on /worker/generate"
    )]
    pub worker_token: Option<String>,

    #[arg(
        short = 'n',
        long = "local-workers",
        env = "LOCAL_WORKERS",
        default_value = "1",
        help = "Number of Active Jobs in Parallel for the in-process queue"
    )]
    pub local_workers: u16,

    #[arg(long = "local-max-deliveries", env = "LOCAL_MAX_DELIVERIES", default_value = "3")]
    pub local_max_deliveries: u32,

    #[arg(long = "scavenger-secret", env = "SCAVENGER_SECRET", hide_env_values = true)]
    pub scavenger_secret: Option<String>,

    #[arg(long = "stale-after-secs", env = "STALE_AFTER_SECS", default_value = "600")]
    pub stale_after_secs: u64,

    #[arg(long = "scavenge-every-secs", env = "SCAVENGE_EVERY_SECS")]
    pub scavenge_every_secs: Option<u64>,

    #[arg(long = "host-name", env = "HOSTNAME")]
    pub host_name: Option<String>,
}

impl ServeArgs {
    pub fn worker_url(&self) -> String {
        format!("{}/worker/generate", self.app_url.trim_end_matches('/'))
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            api_base: self.provider_api_base.clone(),
            api_key: self.provider_api_key.clone(),
            default_model: self.default_model.clone(),
            upscale_model: self.upscale_model.clone(),
            max_edge: self.max_edge,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            retry: RetryPolicy {
                deadline: Duration::from_secs(self.provider_deadline_secs),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            host: self.host_name.clone(),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct SubmitArgs {
    #[arg(long, env = "PHOTOJOB_URL", default_value = "http://127.0.0.1:8080")]
    pub server: String,

    #[arg(long = "image-url")]
    pub image_url: Option<String>,

    #[arg(long)]
    pub prompt: Option<String>,

    #[arg(long)]
    pub category: Option<String>,

    #[arg(long)]
    pub strength: Option<f32>,

    #[arg(long)]
    pub resolution: Option<Resolution>,

    #[arg(long = "aspect-ratio")]
    pub aspect_ratio: Option<String>,

    #[arg(long)]
    pub seed: Option<u32>,

    #[arg(long = "reference-image-url")]
    pub reference_image_urls: Vec<String>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long = "idempotency-key")]
    pub idempotency_key: Option<String>,

    #[arg(long, help = "Poll until the job finishes")]
    pub wait: bool,
}

impl SubmitArgs {
    pub fn request(&self) -> SubmitRequest {
        SubmitRequest {
            image_url: self.image_url.clone(),
            prompt: self.prompt.clone(),
            category: self.category.clone(),
            strength: self.strength,
            resolution: self.resolution,
            aspect_ratio: self.aspect_ratio.clone(),
            seed: self.seed,
            reference_image_urls: self.reference_image_urls.clone(),
            model: self.model.clone(),
            session_id: None,
            idempotency_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let config = ConfigContext::try_parse_from(["photojob", "serve"]).unwrap();
        let Command::Serve(args) = config.command else {
            panic!("expected serve");
        };
        assert_eq!(args.default_resolution, Resolution::OneK);
        assert_eq!(args.local_workers, 1);
        assert_eq!(args.worker_url(), "http://127.0.0.1:8080/worker/generate");
        assert_eq!(args.provider_config().retry.deadline, Duration::from_secs(240));
        assert_eq!(args.stale_after(), Duration::from_secs(600));
    }

    #[test]
    fn submit_flags() {
        let config = ConfigContext::try_parse_from([
            "photojob",
            "--log-json",
            "submit",
            "--image-url",
            "https://x/a.jpg",
            "--prompt",
            "enhance",
            "--resolution",
            "2K",
            "--reference-image-url",
            "https://x/1.jpg",
            "--reference-image-url",
            "https://x/2.jpg",
            "--wait",
        ])
        .unwrap();
        assert!(config.log_json);
        let Command::Submit(args) = config.command else {
            panic!("expected submit");
        };
        assert!(args.wait);
        let request = args.request();
        assert_eq!(request.resolution, Some(Resolution::TwoK));
        assert_eq!(request.reference_image_urls.len(), 2);
    }

    #[test]
    fn bad_resolution_is_rejected() {
        assert!(ConfigContext::try_parse_from(["photojob", "serve", "--default-resolution", "8K"]).is_err());
    }
}
