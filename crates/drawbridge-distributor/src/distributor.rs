//! Pull-worker pool consuming conversion jobs from the durable stream.
//!
//! Each worker fetches one message at a time, drives the task through
//! `processing`, and finishes with a single ack/nak decision: unactionable
//! messages (unknown or expired tasks) are ack'd so they stop redelivering,
//! everything else that fails is nak'd back to the stream.

use crate::converter::Converter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drawbridge_core::models::{Task, TaskStatus};
use drawbridge_queue::PullConsumer;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a single fetch waits for a message before the worker spins.
const FETCH_EXPIRES: Duration = Duration::from_secs(5);
/// Backoff after an unexpected fetch error.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Registry operations the distributor needs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn task(&self, id: Uuid) -> anyhow::Result<Option<Task>>;
    async fn try_mark_processing(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        err_reason: Option<String>,
    ) -> anyhow::Result<()>;
    async fn set_result(&self, id: Uuid, result_filename: &str) -> anyhow::Result<()>;
    async fn expired_tasks(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> anyhow::Result<Vec<Uuid>>;
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> anyhow::Result<usize>;
}

/// File operations the distributor needs: deleting a task's artifacts and
/// sweeping aged files. Deliberately narrower than the full store.
#[async_trait]
pub trait FileCleaner: Send + Sync {
    async fn delete(&self, filename: &str) -> anyhow::Result<()>;
    async fn cleanup_older_than(&self, max_age: Duration) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("task not found")]
    NotFound,

    #[error("task expired")]
    Expired,

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// What to do with the message after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Done with this message, successfully or not.
    Ack,
    /// Processing failed for a reason redelivery may fix.
    Nak,
}

/// Unknown and expired tasks are unactionable; redelivering them would only
/// repeat the same dead end.
pub fn classify(result: &Result<(), ProcessError>) -> AckOutcome {
    match result {
        Ok(()) => AckOutcome::Ack,
        Err(ProcessError::NotFound) | Err(ProcessError::Expired) => AckOutcome::Ack,
        Err(_) => AckOutcome::Nak,
    }
}

/// Drives one task through conversion.
pub struct Processor {
    tasks: Arc<dyn TaskStore>,
    converter: Arc<dyn Converter>,
    conversion_timeout: Duration,
}

impl Processor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        converter: Arc<dyn Converter>,
        conversion_timeout: Duration,
    ) -> Self {
        Processor {
            tasks,
            converter,
            conversion_timeout,
        }
    }

    pub async fn process(&self, raw_task_id: &str) -> Result<(), ProcessError> {
        let task_id = raw_task_id
            .parse::<Uuid>()
            .map_err(|_| ProcessError::NotFound)?;

        let task = self
            .tasks
            .task(task_id)
            .await?
            .ok_or(ProcessError::NotFound)?;

        if task.status == TaskStatus::Expired {
            return Err(ProcessError::Expired);
        }

        // At-least-once delivery means two workers can hold the same task id;
        // the guarded transition lets exactly one proceed.
        if !self.tasks.try_mark_processing(task_id).await? {
            tracing::debug!(task_id = %task_id, "task already claimed, skipping");
            return Ok(());
        }

        tracing::info!(task_id = %task_id, "process start");

        let conversion = self
            .converter
            .convert(&task.input_filename, &task.original_name);
        let outcome = match tokio::time::timeout(self.conversion_timeout, conversion).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "conversion timed out after {:?}",
                self.conversion_timeout
            )),
        };

        match outcome {
            Ok(pdf_name) => {
                self.tasks.set_result(task_id, &pdf_name).await?;
                tracing::info!(task_id = %task_id, pdf_name = %pdf_name, "process done");
                Ok(())
            }
            Err(e) => {
                self.tasks
                    .update_status(task_id, TaskStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(ProcessError::Conversion(e.to_string()))
            }
        }
    }
}

/// The worker pool. All workers share one durable consumer, so the stream's
/// ack window (`2 × pool size`) bounds the number of in-flight jobs.
pub struct Distributor {
    processor: Arc<Processor>,
    consumer: PullConsumer,
    size: usize,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Distributor {
    pub fn new(
        processor: Arc<Processor>,
        consumer: PullConsumer,
        size: usize,
        token: CancellationToken,
    ) -> Self {
        Distributor {
            processor,
            consumer,
            size: size.max(1),
            token,
            handles: Vec::new(),
        }
    }

    pub fn run(&mut self) {
        for worker_id in 0..self.size {
            let processor = Arc::clone(&self.processor);
            let consumer = self.consumer.clone();
            let token = self.token.clone();
            self.handles.push(tokio::spawn(async move {
                worker_loop(worker_id, processor, consumer, token).await;
            }));
        }
        tracing::info!(workers = self.size, "distributor running");
    }

    /// Wait for every worker to observe cancellation and exit.
    pub async fn stop(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("distributor stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    processor: Arc<Processor>,
    consumer: PullConsumer,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        let fetch = consumer
            .fetch()
            .max_messages(1)
            .expires(FETCH_EXPIRES)
            .messages();

        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            batch = fetch => batch,
        };

        let mut messages = match batch {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(worker = worker_id, error = %e, "fetch failed");
                tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                continue;
            }
        };

        // An exhausted batch (fetch deadline with no messages) falls through
        // and the worker spins.
        while let Some(next) = messages.next().await {
            let message = match next {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(worker = worker_id, error = %e, "message receive failed");
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                    break;
                }
            };

            let task_id = String::from_utf8_lossy(&message.payload).to_string();
            tracing::debug!(worker = worker_id, task_id = %task_id, "got message");

            let result = processor.process(&task_id).await;
            if let Err(ref e) = result {
                tracing::error!(task_id = %task_id, error = %e, "process failed");
            }

            match classify(&result) {
                AckOutcome::Ack => {
                    if let Err(e) = message.ack().await {
                        tracing::warn!(task_id = %task_id, error = %e, "ack failed");
                    }
                }
                AckOutcome::Nak => {
                    if let Err(e) = message
                        .ack_with(async_nats::jetstream::AckKind::Nak(None))
                        .await
                    {
                        tracing::warn!(task_id = %task_id, error = %e, "nak failed");
                    }
                }
            }
        }
    }

    tracing::info!(worker = worker_id, "worker stopping");
}
