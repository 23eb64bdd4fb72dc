use std::sync::Arc;

use tracing::{debug, info};

use taskq_core::config::DelayedStreamConfig;
use taskq_core::errors::Result;
use taskq_core::models::Task;
use taskq_core::traits::broker::{Broker, DeliveryStream, ProvisionOutcome};

/// Delayed-delivery queue over a persistent stream.
///
/// The underlying log has no native delay primitive: `not_before`
/// rides inside each record, and consumers requeue records that are
/// not yet due. Scheduling is therefore a consume-time check, not a
/// broker feature.
pub struct DelayedTaskQueue {
    broker: Arc<dyn Broker>,
    config: DelayedStreamConfig,
}

impl DelayedTaskQueue {
    pub fn new(broker: Arc<dyn Broker>, config: DelayedStreamConfig) -> Self {
        Self { broker, config }
    }

    /// Idempotently provisions the delayed stream. Safe to re-run at
    /// every deployment.
    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        let outcome = self.broker.ensure_stream(&self.config.stream_spec()).await?;
        match outcome {
            ProvisionOutcome::Created => {
                info!(stream = %self.config.name, "delayed stream created");
            }
            ProvisionOutcome::AlreadyExists => {
                debug!(stream = %self.config.name, "delayed stream already provisioned");
            }
        }
        Ok(outcome)
    }

    /// Publishes a task to the delayed subject and returns its id.
    pub async fn enqueue(&self, task: &Task) -> Result<String> {
        let payload = task.serialize_bytes()?;
        self.broker.publish(&self.config.subject, &payload).await?;
        debug!(
            task_id = %task.id,
            handler = %task.handler,
            not_before = ?task.not_before,
            "task enqueued on delayed stream"
        );
        Ok(task.id.clone())
    }

    /// Binds the configured durable consumer.
    pub async fn subscribe(&self) -> Result<Box<dyn DeliveryStream>> {
        self.broker.subscribe(&self.config.consumer_spec()).await
    }

    pub fn config(&self) -> &DelayedStreamConfig {
        &self.config
    }
}
