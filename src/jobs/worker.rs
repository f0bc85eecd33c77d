use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{Envelope, MemoryQueue, TaskReceiver};
use super::Task;
use crate::engine::{Engine, RunRequest};
use crate::error::EngineError;

/// Executes one task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, task: &Task) -> Result<(), EngineError>;
}

#[async_trait]
impl TaskHandler for Engine {
    async fn handle(&self, cancel: CancellationToken, task: &Task) -> Result<(), EngineError> {
        match task {
            Task::ScrapeSource {
                slug,
                max_listings,
                full_scrape,
            } => {
                let request = RunRequest {
                    max_listings: *max_listings,
                    full_scrape: *full_scrape,
                    min_delay: None,
                };
                self.run_source_with(cancel, slug, request).await?;
            }
            Task::ScrapeAll => {
                self.run_all(cancel).await?;
            }
            Task::SweepStale { slug } => {
                self.sweep_stale(slug.as_deref()).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks executed at once
    pub concurrency: usize,
    /// Deliveries per task before giving up
    pub max_attempts: u32,
    /// Delay before redelivery, multiplied by the attempt number
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(30),
        }
    }
}

/// Pulls tasks off a [`MemoryQueue`] and runs them with bounded retries.
pub struct Worker<H> {
    handler: Arc<H>,
    queue: MemoryQueue,
    config: WorkerConfig,
}

impl<H: TaskHandler + 'static> Worker<H> {
    pub fn new(handler: Arc<H>, queue: MemoryQueue, config: WorkerConfig) -> Self {
        Self {
            handler,
            queue,
            config,
        }
    }

    /// Process tasks until cancelled or the queue closes.
    pub async fn run(&self, rx: TaskReceiver, cancel: CancellationToken) {
        self.process(rx, cancel, false).await
    }

    /// Process tasks until nothing is queued or running.
    pub async fn run_until_idle(&self, rx: TaskReceiver, cancel: CancellationToken) {
        self.process(rx, cancel, true).await
    }

    async fn process(&self, mut rx: TaskReceiver, cancel: CancellationToken, until_idle: bool) {
        info!("Worker started (concurrency={})", self.config.concurrency);
        let mut inflight = JoinSet::new();

        loop {
            if until_idle && inflight.is_empty() {
                match rx.try_recv() {
                    Ok(envelope) => {
                        self.dispatch(envelope, &mut inflight, &cancel).await;
                        continue;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Task panicked: {}", e);
                    }
                }
                received = rx.recv() => match received {
                    Some(envelope) => self.dispatch(envelope, &mut inflight, &cancel).await,
                    None => break,
                },
            }
        }

        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!("Task panicked: {}", e);
            }
        }
        info!("Worker stopped");
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        inflight: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        while inflight.len() >= self.config.concurrency.max(1) {
            if let Some(Err(e)) = inflight.join_next().await {
                error!("Task panicked: {}", e);
            }
        }

        let handler = self.handler.clone();
        let queue = self.queue.clone();
        let config = self.config.clone();
        let cancel = cancel.clone();

        inflight.spawn(async move {
            let kind = envelope.task.kind();
            info!(task_id = %envelope.id, attempt = envelope.attempt, "Running {} task", kind);

            let error = match handler.handle(cancel.clone(), &envelope.task).await {
                Ok(()) => {
                    debug!(task_id = %envelope.id, "Task {} done", kind);
                    return;
                }
                Err(e) => e,
            };

            if !error.is_retryable() || envelope.attempt >= config.max_attempts {
                error!(
                    task_id = %envelope.id,
                    attempt = envelope.attempt,
                    "Task {} failed permanently: {}",
                    kind,
                    error
                );
                return;
            }

            let delay = config.retry_backoff * envelope.attempt;
            warn!(
                task_id = %envelope.id,
                attempt = envelope.attempt,
                "Task {} failed, retrying in {:?}: {}",
                kind,
                delay,
                error
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = queue.push(envelope.retry()).await {
                error!("Could not requeue {} task: {}", kind, e);
            }
        });
    }
}
