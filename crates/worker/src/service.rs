use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use taskq_core::config::WorkerConfig;
use taskq_core::errors::Result;
use taskq_core::models::Task;
use taskq_core::traits::broker::{Broker, ConsumerSpec, Delivery};

use crate::context::WorkerContext;
use crate::registry::{HandlerRegistry, LifecycleHook};

/// Consumer-side knobs the dispatch loop needs beyond `WorkerConfig`.
#[derive(Clone)]
pub struct DispatchOptions {
    /// Immediate task subject consumer.
    pub task_consumer: ConsumerSpec,
    /// Delayed stream consumer.
    pub delayed_consumer: ConsumerSpec,
    pub dead_letter_subject: String,
    /// Cap on the requeue delay for records that are not yet due.
    pub requeue_backoff_max: Duration,
}

/// Pulls deliveries from the immediate and delayed streams and runs
/// the registered handlers.
///
/// Concurrency is bounded by a semaphore; distinct deliveries run
/// concurrently while each delivery is handled exactly one at a time
/// by whichever worker the broker picked. Handler failures never
/// crash the loop: the task is republished with its retry count
/// bumped until the budget runs out, then dead-lettered.
pub struct WorkerService {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    config: WorkerConfig,
    options: DispatchOptions,
}

impl WorkerService {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        hooks: Vec<Arc<dyn LifecycleHook>>,
        config: WorkerConfig,
        options: DispatchOptions,
    ) -> Self {
        Self {
            broker,
            registry,
            hooks,
            config,
            options,
        }
    }

    /// Runs until a shutdown signal arrives, then drains in-flight
    /// handlers within the grace period. Past the grace period,
    /// unacknowledged deliveries are abandoned to broker redelivery.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut context = WorkerContext::new(&self.config.worker_id);
        for hook in &self.hooks {
            hook.on_startup(&mut context).await?;
        }
        let context = Arc::new(context);

        info!(
            worker_id = %self.config.worker_id,
            handlers = ?self.registry.handler_names(),
            max_concurrent = self.config.max_concurrent_tasks,
            "worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        let consumers = [
            self.options.task_consumer.clone(),
            self.options.delayed_consumer.clone(),
        ];
        let mut pull_loops = Vec::new();
        for consumer in consumers {
            let mut stream = self.broker.subscribe(&consumer).await?;
            let broker = self.broker.clone();
            let registry = self.registry.clone();
            let context = context.clone();
            let semaphore = semaphore.clone();
            let options = self.options.clone();
            let max_retries = self.config.max_retries;
            let mut shutdown_rx = shutdown.resubscribe();

            pull_loops.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        next = stream.next() => next,
                    };
                    let delivery = match next {
                        Ok(Some(delivery)) => delivery,
                        Ok(None) => {
                            debug!(durable = %consumer.durable_name, "delivery stream closed");
                            break;
                        }
                        Err(e) => {
                            error!(durable = %consumer.durable_name, error = %e, "delivery stream failed");
                            break;
                        }
                    };

                    // A full semaphore must not pin the loop past
                    // shutdown; the pulled delivery goes back to the
                    // broker for redelivery.
                    let permit = tokio::select! {
                        _ = shutdown_rx.recv() => {
                            if let Err(e) = delivery.nack(None).await {
                                warn!(durable = %consumer.durable_name, error = %e, "nack on shutdown failed");
                            }
                            break;
                        }
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let broker = broker.clone();
                    let registry = registry.clone();
                    let context = context.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        dispatch_delivery(broker, registry, context, delivery, options, max_retries)
                            .await;
                        drop(permit);
                    });
                }
            }));
        }

        let _ = shutdown.recv().await;
        info!("worker draining, no further deliveries");
        // The grace period covers the whole drain: pull loops exiting
        // and in-flight handlers releasing their permits. A stuck
        // handler cannot hold shutdown hostage.
        let max_permits = self.config.max_concurrent_tasks as u32;
        let drain = async {
            for pull_loop in pull_loops {
                let _ = pull_loop.await;
            }
            let _ = semaphore.acquire_many(max_permits).await;
        };
        if timeout(self.config.shutdown_grace(), drain).await.is_err() {
            warn!(
                grace_seconds = self.config.shutdown_grace_seconds,
                "grace period elapsed, abandoning in-flight tasks to redelivery"
            );
        }

        for hook in &self.hooks {
            if let Err(e) = hook.on_shutdown(&context).await {
                warn!(error = %e, "shutdown hook failed");
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }
}

/// Handles one delivery end to end. Never returns an error; every
/// outcome is settled against the broker.
async fn dispatch_delivery(
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    context: Arc<WorkerContext>,
    delivery: Delivery,
    options: DispatchOptions,
    max_retries: u32,
) {
    let task = match Task::deserialize_bytes(&delivery.payload) {
        Ok(task) => task,
        Err(e) => {
            // Garbage never becomes parseable; retrying is pointless.
            warn!(subject = %delivery.subject, error = %e, "undecodable payload, dead-lettering");
            dead_letter(&broker, &options.dead_letter_subject, delivery).await;
            return;
        }
    };

    let now = Utc::now();
    if !task.is_due(now) {
        let remaining = task
            .not_before
            .map(|not_before| (not_before - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        let delay = remaining.min(options.requeue_backoff_max);
        debug!(task_id = %task.id, delay_ms = delay.as_millis() as u64, "not due yet, requeueing");
        if let Err(e) = delivery.nack(Some(delay)).await {
            warn!(task_id = %task.id, error = %e, "requeue failed");
        }
        return;
    }

    let handler = match registry.lookup(&task.handler) {
        Ok(handler) => handler,
        Err(e) => {
            // No amount of redelivery produces a handler this process
            // does not have.
            warn!(task_id = %task.id, error = %e, "dead-lettering");
            dead_letter(&broker, &options.dead_letter_subject, delivery).await;
            return;
        }
    };

    match handler.handle(&context, &task).await {
        Ok(()) => {
            debug!(task_id = %task.id, handler = %task.handler, retry_count = task.retry_count, "task completed");
            if let Err(e) = delivery.ack().await {
                warn!(task_id = %task.id, error = %e, "ack failed, task may be redelivered");
            }
        }
        Err(e) if task.retry_count + 1 >= max_retries => {
            error!(
                task_id = %task.id,
                handler = %task.handler,
                retry_count = task.retry_count,
                error = %e,
                "retry budget exhausted, dead-lettering"
            );
            dead_letter(&broker, &options.dead_letter_subject, delivery).await;
        }
        Err(e) => {
            warn!(
                task_id = %task.id,
                handler = %task.handler,
                retry_count = task.retry_count,
                max_retries,
                error = %e,
                "task failed, republishing for retry"
            );
            republish_retry(&broker, task, delivery).await;
        }
    }
}

/// Republish the task with its retry count bumped, then ack the old
/// delivery. Failure accounting rides in the record itself, so
/// not-yet-due requeues and ack-wait redeliveries never eat into the
/// handler's retry budget. If the publish fails the delivery is nacked
/// and comes back with its count intact.
async fn republish_retry(broker: &Arc<dyn Broker>, mut task: Task, delivery: Delivery) {
    task.increment_retry();
    let bytes = match task.serialize_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(task_id = %task.id, error = %e, "retry serialization failed");
            if let Err(e) = delivery.nack(None).await {
                warn!(task_id = %task.id, error = %e, "nack failed");
            }
            return;
        }
    };
    match broker.publish(&delivery.subject, &bytes).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(task_id = %task.id, error = %e, "ack after retry republish failed");
            }
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "retry republish failed, leaving record for redelivery");
            if let Err(e) = delivery.nack(None).await {
                warn!(task_id = %task.id, error = %e, "nack failed");
            }
        }
    }
}

/// Publish to the dead-letter subject, then ack. Publishing first
/// keeps the record recoverable: if the publish fails the delivery is
/// nacked and comes back.
async fn dead_letter(broker: &Arc<dyn Broker>, subject: &str, delivery: Delivery) {
    match broker.publish(subject, &delivery.payload).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "ack after dead-letter failed");
            }
        }
        Err(e) => {
            error!(error = %e, "dead-letter publish failed, leaving record for redelivery");
            if let Err(e) = delivery.nack(None).await {
                warn!(error = %e, "nack failed");
            }
        }
    }
}
