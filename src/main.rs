use anyhow::{anyhow, bail, Error};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use photojob::api::{self, AppState};
use photojob::config::{Command, ConfigContext, ServeArgs, SubmitArgs};
use photojob::db::{DbHandle, JobStore, MemoryStore};
use photojob::poller::JobClient;
use photojob::provider::ProviderAdapter;
use photojob::queue::{HttpQueue, JobQueue};
use photojob::scavenger::Scavenger;
use photojob::server;
use photojob::storage::{HttpObjectStore, LocalObjectStore, MemoryObjectStore, ObjectStore};
use photojob::submit::Submitter;
use photojob::worker::JobRunner;
use photojob::{telemetry, Status};

const USER_AGENT: &str = concat!("photojob/", env!("CARGO_PKG_VERSION"));

async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    match config.command {
        Command::Serve(args) => serve(args, cancel_token).await,
        Command::Submit(args) => {
            tokio::select! {
                result = submit(args) => result,
                _ = cancel_token.cancelled() => Ok(()),
            }
        }
    }
}

fn object_store(args: &ServeArgs, http: &reqwest::Client) -> Result<Arc<dyn ObjectStore>, Error> {
    if let Some(endpoint) = &args.storage_endpoint {
        let token = args
            .storage_token
            .clone()
            .ok_or_else(|| anyhow!("--storage-token is required with --storage-endpoint"))?;
        return Ok(Arc::new(HttpObjectStore::new(
            http.clone(),
            endpoint.clone(),
            args.storage_bucket.clone(),
            token,
            args.public_base_url.clone(),
        )));
    }
    if let Some(dir) = &args.storage_dir {
        return Ok(Arc::new(LocalObjectStore::new(dir.clone(), args.public_base_url.clone())));
    }
    warn!("No storage configured, results are kept in memory");
    Ok(Arc::new(MemoryObjectStore::new(args.public_base_url.clone())))
}

#[instrument(skip_all, fields(listen = %args.listen))]
async fn serve(args: ServeArgs, cancel_token: CancellationToken) -> Result<(), Error> {
    let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

    let store: Arc<dyn JobStore> = match &args.database_url {
        Some(url) => Arc::new(DbHandle::new(url, args.db_connections).await?),
        None => {
            warn!("No database configured, jobs are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let objects = object_store(&args, &http)?;
    let backup = args.backup_dir.as_ref().map(|dir| {
        Arc::new(LocalObjectStore::new(dir.clone(), args.public_base_url.clone())) as Arc<dyn ObjectStore>
    });

    let generator = Arc::new(ProviderAdapter::new(http.clone(), args.provider_config()));
    let runner = Arc::new(
        JobRunner::new(store.clone(), generator, objects, http.clone(), args.worker_config()).with_backup(backup),
    );

    let mut handles = vec![];

    let queue: Arc<dyn JobQueue> = match &args.queue_url {
        Some(url) => Arc::new(
            HttpQueue::new(http.clone(), url.clone(), args.queue_token.clone())
                .with_retries(args.queue_retries)
                .with_worker_token(args.worker_token.clone()),
        ),
        None => {
            info!(message = "Running jobs in-process", workers = args.local_workers);
            let (queue, handle) = server::spawn(
                cancel_token.clone(),
                runner.clone(),
                args.local_workers,
                args.local_max_deliveries,
            );
            handles.push(tokio::spawn(async move {
                match handle.await {
                    Ok(Err(err)) => error!("Local queue stopped with error: {err:#}"),
                    Err(err) => error!("Local queue panicked: {err}"),
                    Ok(Ok(())) => {}
                }
            }));
            Arc::new(queue)
        }
    };

    let submitter = Arc::new(
        Submitter::new(store.clone(), queue, args.worker_url())
            .with_queue_name(Some(args.queue_name.clone()))
            .with_default_resolution(args.default_resolution),
    );

    let scavenger = Arc::new(Scavenger::new(store.clone()).with_stale_after(args.stale_after()));
    if let Some(secs) = args.scavenge_every_secs {
        let scavenger = scavenger.clone();
        let cancel_token = cancel_token.clone();
        handles.push(tokio::spawn(
            async move { scavenger.run_every(Duration::from_secs(secs), cancel_token).await }
                .instrument(info_span!("scavenger")),
        ));
    }

    let state = Arc::new(AppState {
        store,
        submitter,
        runner,
        scavenger,
        worker_token: args.worker_token.clone(),
        scavenger_secret: args.scavenger_secret.clone(),
    });

    let listener = TcpListener::bind(args.listen).await?;
    info!(message = "Listening", addr = %args.listen);

    let shutdown = cancel_token.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel_token.cancel();
    println!("Waiting for workers to shutdown...");
    futures::future::join_all(handles).await;

    Ok(())
}

async fn submit(args: SubmitArgs) -> Result<(), Error> {
    let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
    let client = JobClient::new(http, args.server.clone());

    let response = client.submit(&args.request(), args.idempotency_key.as_deref()).await?;
    println!(
        "{}",
        serde_json::json!({
            "jobId": response.job_id,
            "sessionId": response.session_id,
            "seed": response.seed,
            "reused": response.reused,
        })
    );

    if args.wait {
        let view = client.wait_for_terminal(response.job_id).await?;
        println!("{}", serde_json::to_string_pretty(&view)?);
        if view.status == Status::Failed {
            bail!(
                "job {} failed: {}",
                view.id,
                view.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref(), config.log_json)?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await?;
    println!("Shutting down.");
    telemetry::shutdown();

    result?;
    Ok(())
}
