use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskQueueError};

/// How long a persisted record remains available to consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Age/size-bounded retention.
    #[default]
    Limits,
    /// Retained while any consumer is interested.
    Interest,
    /// Removed once acknowledged by the work-queue consumer.
    WorkQueue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Crash-durable, survives broker restart.
    #[default]
    File,
    /// Volatile, broker-process lifetime only.
    Memory,
}

/// Outcome of idempotent stream provisioning. An existing stream is
/// success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    AlreadyExists,
}

/// Declarative description of a persistent, replayable stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageMode,
    /// How long the broker waits for an acknowledgment before
    /// redelivering.
    pub ack_wait: Duration,
    pub dead_letter_subject: Option<String>,
}

impl StreamSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TaskQueueError::Configuration(
                "stream name must not be empty".to_string(),
            ));
        }
        if self.subjects.is_empty() || self.subjects.iter().any(|s| s.is_empty()) {
            return Err(TaskQueueError::Configuration(format!(
                "stream {} requires at least one non-empty subject",
                self.name
            )));
        }
        Ok(())
    }
}

/// A named durable consumer binding. The delivery cursor is held
/// server-side and survives client disconnects and process restarts.
/// Redelivery is unbounded on the broker side; the retry cutoff lives
/// in the task record so delay requeues cannot exhaust it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub subject: String,
    pub durable_name: String,
    pub ack_wait: Duration,
}

/// Per-delivery acknowledgment handle.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    /// Requeues the record; an optional delay defers its next
    /// visibility to the consumer group.
    async fn nack(&self, delay: Option<Duration>) -> Result<()>;
}

/// One record handed to a durable consumer.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    /// 1-based delivery attempt for this consumer.
    pub attempt: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(subject: String, payload: Vec<u8>, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            subject,
            payload,
            attempt,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, delay: Option<Duration>) -> Result<()> {
        self.acker.nack(delay).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("attempt", &self.attempt)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Pull-style stream of deliveries for one durable consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Waits for the next visible record. `None` means the stream is
    /// closed and no further deliveries will arrive.
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// Publish/subscribe abstraction over a message-streaming backend.
///
/// Delivery is at-least-once: handlers must be idempotent or
/// deduplicate by task id. Within one durable consumer, records
/// published by the same producer to the same subject arrive in
/// publish order.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently provisions a stream. Safe to re-run with the same
    /// parameters at every deployment.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<ProvisionOutcome>;

    /// Acknowledged publish. Fails with `Backpressure` once the
    /// bounded client-side buffer is full, and with `Publish` on
    /// transport failure.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()>;

    /// Binds a named durable consumer and returns its delivery stream.
    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Box<dyn DeliveryStream>>;
}
