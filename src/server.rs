use crate::queue::{JobQueue, QueueError, WorkerPayload};
use crate::worker::{self, Delivery, JobRunner, RunOutcome, WorkMessage};
use anyhow::Error;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// In-process queue: payloads go straight to a local worker pool.
#[derive(Clone)]
pub struct LocalQueue {
    send_to_server: mpsc::UnboundedSender<WorkerPayload>,
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn publish(&self, _target_url: &str, payload: &WorkerPayload) -> Result<(), QueueError> {
        self.send_to_server
            .send(payload.clone())
            .map_err(|_| QueueError::Closed)
    }
}

/// Starts [`serve`] on its own task and returns the queue that feeds it.
pub fn spawn(
    cancel_token: CancellationToken,
    runner: Arc<JobRunner>,
    workers_count: u16,
    max_deliveries: u32,
) -> (LocalQueue, JoinHandle<Result<(), Error>>) {
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
    let handle = tokio::spawn(
        serve(cancel_token, runner, workers_count, max_deliveries, recv_from_client)
            .instrument(info_span!("local_queue")),
    );
    (LocalQueue { send_to_server }, handle)
}

/// Hands payloads to `workers_count` workers, never more than one per free
/// worker. A delivery whose run returns an error is queued again until it has
/// been attempted `max_deliveries` times.
pub async fn serve(
    cancel_token: CancellationToken,
    runner: Arc<JobRunner>,
    workers_count: u16,
    max_deliveries: u32,
    mut recv_from_client: mpsc::UnboundedReceiver<WorkerPayload>,
) -> Result<(), Error> {
    let workers_count = workers_count.max(1);
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Delivery>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let runner = runner.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, recv_from_queue, send_to_server, runner).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = workers_count as i64;
    let mut backlog: VecDeque<Delivery> = VecDeque::new();

    loop {
        while free_workers > 0 {
            let Some(delivery) = backlog.pop_front() else {
                break;
            };
            send_to_queue.send(delivery).await?;
            free_workers -= 1;
        }

        // Waiting for something else to happen to continue...
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobStarted(job_id)) => {
                        debug!(message = "Starting job", job_id = %job_id);
                    },
                    Some(WorkMessage::JobFinished(job_id, outcome)) => {
                        free_workers += 1;
                        match outcome {
                            RunOutcome::Completed { result_url } => {
                                info!(message = "Completed job", job_id = %job_id, result_url = %result_url);
                            },
                            RunOutcome::Failed { error } => {
                                info!(message = "Failed job", job_id = %job_id, error = %error);
                            },
                            RunOutcome::Skipped(status) => {
                                debug!(message = "Skipped job", job_id = %job_id, status = ?status);
                            },
                        }
                    },
                    Some(WorkMessage::JobFailed(delivery, error_msg)) => {
                        free_workers += 1;
                        let job_id = delivery.payload.job_id;
                        if delivery.attempt < max_deliveries {
                            warn!(message = "Redelivering job", job_id = %job_id, attempt = delivery.attempt, error = %error_msg);
                            backlog.push_back(Delivery {
                                payload: delivery.payload,
                                attempt: delivery.attempt + 1,
                            });
                        } else {
                            error!(message = "Giving up on job", job_id = %job_id, attempts = delivery.attempt, error = %error_msg);
                        }
                    },
                }
            },
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(payload) => {
                        debug!(message = "Queued job", job_id = %payload.job_id);
                        backlog.push_back(Delivery { payload, attempt: 1 });
                    }
                }
            }
        }
    }

    if !backlog.is_empty() {
        warn!(message = "Dropping undelivered jobs", count = backlog.len());
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobStore, MemoryStore};
    use crate::storage::MemoryObjectStore;
    use crate::worker::tests::FakeGenerator;
    use crate::worker::WorkerConfig;
    use crate::{ExecutionMetadata, NewJob, Status};
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn local_queue_runs_jobs_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(FakeGenerator::succeeding());
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            generator.clone(),
            Arc::new(MemoryObjectStore::new("http://cdn.local")),
            reqwest::Client::new(),
            WorkerConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let (queue, handle) = spawn(cancel.clone(), runner, 1, 3);

        let mut ids = vec![];
        for _ in 0..3 {
            let job = store
                .insert(NewJob {
                    input_url: Some("https://x/a.jpg".into()),
                    prompt: Some("enhance".into()),
                    category: None,
                    user_id: None,
                    execution_metadata: ExecutionMetadata::default(),
                })
                .await
                .unwrap();
            let payload = WorkerPayload {
                job_id: job.id,
                session_id: "s".into(),
                image_url: job.input_url.clone(),
                reference_image_urls: vec![],
                original_request_body: Value::Null,
                caller_id: None,
            };
            queue.publish("local", &payload).await.unwrap();
            // the same payload twice: the second delivery must be a no-op
            queue.publish("local", &payload).await.unwrap();
            ids.push(job.id);
        }

        let mut done = false;
        for _ in 0..100 {
            let mut all = true;
            for id in &ids {
                let job = store.get(*id).await.unwrap().unwrap();
                all &= job.status == Status::Completed;
            }
            if all {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done, "jobs did not complete");
        assert_eq!(generator.requests.lock().unwrap().len(), 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
