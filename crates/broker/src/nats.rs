use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, stream};
use async_nats::ServerAddr;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use taskq_core::config::BrokerConfig;
use taskq_core::errors::{Result, TaskQueueError};
use taskq_core::traits::broker::{
    Acker, Broker, ConsumerSpec, Delivery, DeliveryStream, ProvisionOutcome, RetentionPolicy,
    StorageMode, StreamSpec,
};

/// NATS JetStream transport.
///
/// Owns the connection lifecycle; the client reconnects transparently
/// on transient network loss. Publishes are acknowledged and bounded
/// by an in-flight window, past which they fail loudly instead of
/// buffering further.
pub struct NatsBroker {
    jetstream: jetstream::Context,
    publish_permits: Arc<Semaphore>,
}

impl NatsBroker {
    /// Connects with a bounded retry budget; exhausting it is fatal
    /// at startup.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let addrs = parse_server_addrs(&config.servers)?;

        let mut last_error = None;
        for attempt in 0..config.connect_max_retries {
            match async_nats::connect(addrs.clone()).await {
                Ok(client) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "connected to NATS after retries");
                    }
                    info!(servers = ?config.servers, "connected to NATS");
                    return Ok(Self {
                        jetstream: jetstream::new(client),
                        publish_permits: Arc::new(Semaphore::new(config.max_inflight_publishes)),
                    });
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max = config.connect_max_retries,
                        error = %e,
                        "failed to connect to NATS, retrying in {}s",
                        config.connect_retry_delay_seconds
                    );
                    last_error = Some(e);
                    if attempt + 1 < config.connect_max_retries {
                        sleep(config.connect_retry_delay()).await;
                    }
                }
            }
        }

        Err(TaskQueueError::Connection(format!(
            "failed to connect to NATS after {} attempts: {}",
            config.connect_max_retries,
            last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }
}

fn parse_server_addrs(servers: &[String]) -> Result<Vec<ServerAddr>> {
    servers
        .iter()
        .map(|s| {
            s.parse::<ServerAddr>().map_err(|e| {
                TaskQueueError::Configuration(format!("invalid NATS server address {s}: {e}"))
            })
        })
        .collect()
}

fn map_retention(policy: RetentionPolicy) -> stream::RetentionPolicy {
    match policy {
        RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
        RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
        RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
    }
}

fn map_storage(mode: StorageMode) -> stream::StorageType {
    match mode {
        StorageMode::File => stream::StorageType::File,
        StorageMode::Memory => stream::StorageType::Memory,
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<ProvisionOutcome> {
        spec.validate()?;

        if self.jetstream.get_stream(&spec.name).await.is_ok() {
            debug!(stream = %spec.name, "stream already exists");
            return Ok(ProvisionOutcome::AlreadyExists);
        }

        self.jetstream
            .create_stream(stream::Config {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                retention: map_retention(spec.retention),
                storage: map_storage(spec.storage),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                TaskQueueError::StreamProvision(format!(
                    "failed to create stream {}: {e}",
                    spec.name
                ))
            })?;

        info!(stream = %spec.name, subjects = ?spec.subjects, "stream created");
        Ok(ProvisionOutcome::Created)
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let _permit = self.publish_permits.try_acquire().map_err(|_| {
            warn!(subject, "publish window full");
            TaskQueueError::Backpressure {
                subject: subject.to_string(),
            }
        })?;

        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|e| TaskQueueError::publish(subject, e))?;
        ack.await
            .map_err(|e| TaskQueueError::publish(subject, e))?;
        Ok(())
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Box<dyn DeliveryStream>> {
        let stream = self.jetstream.get_stream(&spec.stream).await.map_err(|e| {
            TaskQueueError::Connection(format!("stream {} unavailable: {e}", spec.stream))
        })?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &spec.durable_name,
                // No max_deliver: not-yet-due records cycle through
                // Nak indefinitely, so a server-side cap would strand
                // them. The worker enforces the retry cutoff.
                jetstream::consumer::pull::Config {
                    durable_name: Some(spec.durable_name.clone()),
                    filter_subject: spec.subject.clone(),
                    ack_wait: spec.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                TaskQueueError::Connection(format!(
                    "failed to bind durable consumer {}: {e}",
                    spec.durable_name
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            TaskQueueError::Connection(format!("failed to open delivery stream: {e}"))
        })?;
        debug!(stream = %spec.stream, durable = %spec.durable_name, "durable consumer bound");

        Ok(Box::new(NatsDeliveryStream { messages }))
    }
}

struct NatsDeliveryStream {
    messages: jetstream::consumer::pull::Stream,
}

#[async_trait]
impl DeliveryStream for NatsDeliveryStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.messages.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(TaskQueueError::Connection(format!(
                "delivery stream failed: {e}"
            ))),
            Some(Ok(message)) => {
                let attempt = message.info().map(|info| info.delivered as u32).unwrap_or(1);
                let subject = message.subject.to_string();
                let payload = message.payload.to_vec();
                Ok(Some(Delivery::new(
                    subject,
                    payload,
                    attempt,
                    Box::new(NatsAcker { message }),
                )))
            }
        }
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| TaskQueueError::Internal(format!("ack failed: {e}")))
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(jetstream::AckKind::Nak(delay))
            .await
            .map_err(|e| TaskQueueError::Internal(format!("nack failed: {e}")))
    }
}
