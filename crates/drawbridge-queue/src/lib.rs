//! Durable conversion queue over NATS JetStream.
//!
//! The stream is created on boot with file-backed storage and a message age
//! cap of twice the task TTL, so undelivered jobs cannot outlive the records
//! they point at. Consumers are durable, explicit-ack, and pull-based.

use async_nats::jetstream::{self, consumer};
use std::time::Duration;

pub const STREAM_NAME: &str = "DWG_CONVERSION";
pub const CONSUMER_NAME: &str = "dwg-conversion-consumer";

pub type PullConsumer = consumer::Consumer<consumer::pull::Config>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("empty task id")]
    EmptyTaskId,

    #[error("nats connect: {0}")]
    Connect(String),

    #[error("jetstream stream: {0}")]
    Stream(String),

    #[error("jetstream consumer: {0}")]
    Consumer(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Connect to the NATS server with the configured connection name and
/// reconnect budget.
pub async fn connect(
    url: &str,
    name: &str,
    max_reconnects: usize,
) -> QueueResult<async_nats::Client> {
    async_nats::ConnectOptions::new()
        .name(name)
        .max_reconnects(max_reconnects)
        .connect(url)
        .await
        .map_err(|e| QueueError::Connect(e.to_string()))
}

/// Create the conversion stream if it does not exist yet and return the
/// JetStream context.
pub async fn ensure_stream(
    client: async_nats::Client,
    subject: &str,
    max_age: Duration,
) -> QueueResult<jetstream::Context> {
    let js = jetstream::new(client);

    js.get_or_create_stream(jetstream::stream::Config {
        name: STREAM_NAME.to_string(),
        subjects: vec![subject.to_string()],
        storage: jetstream::stream::StorageType::File,
        num_replicas: 1,
        max_age,
        ..Default::default()
    })
    .await
    .map_err(|e| QueueError::Stream(e.to_string()))?;

    Ok(js)
}

/// Bind the durable pull consumer shared by the distributor workers.
pub async fn pull_consumer(
    js: &jetstream::Context,
    subject: &str,
    pool_size: usize,
) -> QueueResult<PullConsumer> {
    let stream = js
        .get_stream(STREAM_NAME)
        .await
        .map_err(|e| QueueError::Stream(e.to_string()))?;

    stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            consumer::pull::Config {
                durable_name: Some(CONSUMER_NAME.to_string()),
                ack_policy: consumer::AckPolicy::Explicit,
                filter_subject: subject.to_string(),
                max_ack_pending: (pool_size * 2) as i64,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| QueueError::Consumer(e.to_string()))
}

/// Publishes task ids onto the conversion subject.
#[derive(Clone)]
pub struct Publisher {
    js: jetstream::Context,
    subject: String,
}

impl Publisher {
    pub fn new(js: jetstream::Context, subject: impl Into<String>) -> Self {
        Publisher {
            js,
            subject: subject.into(),
        }
    }

    /// Publish a task id as the raw message payload. Rejects empty ids.
    pub async fn enqueue(&self, task_id: &str) -> QueueResult<()> {
        if task_id.is_empty() {
            return Err(QueueError::EmptyTaskId);
        }

        let ack = self
            .js
            .publish(
                self.subject.clone(),
                bytes::Bytes::from(task_id.to_string()),
            )
            .await
            .map_err(|e| QueueError::Publish(format!("enqueue task {}: {}", task_id, e)))?
            .await
            .map_err(|e| QueueError::Publish(format!("enqueue task {}: {}", task_id, e)))?;

        tracing::debug!(
            task_id,
            subject = %self.subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            "task enqueued"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_and_consumer_names() {
        assert_eq!(STREAM_NAME, "DWG_CONVERSION");
        assert_eq!(CONSUMER_NAME, "dwg-conversion-consumer");
    }

    #[test]
    fn empty_task_id_error_is_distinct() {
        let err = QueueError::EmptyTaskId;
        assert_eq!(err.to_string(), "empty task id");
    }
}
