use async_trait::async_trait;
use tracing::info;

use taskq_core::errors::Result;
use taskq_core::models::Task;

use crate::context::WorkerContext;
use crate::registry::TaskHandler;

/// Logs the task payload and succeeds. Default wiring for smoke
/// testing a deployment end to end.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, context: &WorkerContext, task: &Task) -> Result<()> {
        info!(
            worker_id = %context.worker_id(),
            task_id = %task.id,
            payload = %task.payload,
            "echo"
        );
        Ok(())
    }
}
