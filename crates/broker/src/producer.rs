use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskq_core::errors::Result;
use taskq_core::models::Task;
use taskq_core::traits::broker::Broker;

use crate::delayed::DelayedTaskQueue;

/// Producer facade for application code.
///
/// Immediate sends go straight to the task subject; delayed sends go
/// through the delayed queue. Publish failures surface to the caller
/// unchanged.
pub struct TaskProducer {
    broker: Arc<dyn Broker>,
    task_subject: String,
    delayed: Arc<DelayedTaskQueue>,
}

impl TaskProducer {
    pub fn new(
        broker: Arc<dyn Broker>,
        task_subject: impl Into<String>,
        delayed: Arc<DelayedTaskQueue>,
    ) -> Self {
        Self {
            broker,
            task_subject: task_subject.into(),
            delayed,
        }
    }

    /// Publishes a task for immediate dispatch and returns its id.
    pub async fn send(&self, task: &Task) -> Result<String> {
        let payload = task.serialize_bytes()?;
        self.broker.publish(&self.task_subject, &payload).await?;
        debug!(task_id = %task.id, handler = %task.handler, "task sent");
        Ok(task.id.clone())
    }

    /// Publishes a task that must not run before `not_before`.
    pub async fn send_delayed(&self, task: &Task, not_before: DateTime<Utc>) -> Result<String> {
        let mut delayed_task = task.clone();
        delayed_task.not_before = Some(not_before);
        self.delayed.enqueue(&delayed_task).await
    }
}
