use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use taskq_broker::{Broker, BrokerFactory, DelayedTaskQueue, TaskProducer};
use taskq_core::config::AppConfig;
use taskq_scheduler::{
    LabelScheduleSource, RedisScheduleSource, ScheduleRegistry, ScheduleSource, SchedulerService,
};
use taskq_worker::{DispatchOptions, EchoHandler, HandlerRegistry, LifecycleHook, WorkerService};

/// Which services this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Scheduler,
    Worker,
    All,
}

/// Wires the broker, streams and services out of configuration.
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: Arc<dyn Broker>,
    delayed: Arc<DelayedTaskQueue>,
    producer: Arc<TaskProducer>,
    handlers: Arc<HandlerRegistry>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl Application {
    /// Default wiring with the built-in `echo` handler.
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", Arc::new(EchoHandler));
        Self::with_handlers(config, mode, handlers, Vec::new()).await
    }

    /// Wiring with application-provided handlers and lifecycle hooks.
    pub async fn with_handlers(
        config: AppConfig,
        mode: AppMode,
        handlers: HandlerRegistry,
        hooks: Vec<Arc<dyn LifecycleHook>>,
    ) -> Result<Self> {
        info!(?mode, "initializing application");

        let broker = BrokerFactory::create(&config.broker)
            .await
            .context("failed to create broker")?;

        // Streams are provisioned idempotently at every startup.
        broker
            .ensure_stream(&config.task_stream_spec())
            .await
            .context("failed to provision task stream")?;
        let delayed = Arc::new(DelayedTaskQueue::new(
            broker.clone(),
            config.delayed_stream.clone(),
        ));
        delayed
            .provision()
            .await
            .context("failed to provision delayed stream")?;

        let producer = Arc::new(TaskProducer::new(
            broker.clone(),
            config.broker.task_subject.clone(),
            delayed.clone(),
        ));

        Ok(Self {
            config,
            mode,
            broker,
            delayed,
            producer,
            handlers: Arc::new(handlers),
            hooks,
        })
    }

    pub fn producer(&self) -> Arc<TaskProducer> {
        self.producer.clone()
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        match self.mode {
            AppMode::Scheduler => self.run_scheduler(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::All => self.run_all(shutdown_rx).await,
        }
    }

    async fn run_scheduler(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("starting scheduler service");

        let mut sources: Vec<Arc<dyn ScheduleSource>> = vec![Arc::new(
            LabelScheduleSource::with_entries(self.handlers.schedule_entries().to_vec()),
        )];

        if self.config.schedule_store.enabled {
            // An unreachable store at startup degrades to label
            // entries; the external source can come back later via a
            // restart or the store itself.
            match RedisScheduleSource::connect(&self.config.schedule_store).await {
                Ok(source) => sources.push(Arc::new(source)),
                Err(e) => {
                    warn!(error = %e, "schedule store unreachable, continuing with label entries only");
                }
            }
        }

        let registry = Arc::new(ScheduleRegistry::new(sources));
        let service = SchedulerService::new(
            registry,
            self.producer.clone(),
            self.config.scheduler.clone(),
        );
        service.run(shutdown_rx).await?;
        Ok(())
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("starting worker service");

        let options = DispatchOptions {
            task_consumer: self.config.task_consumer_spec(),
            delayed_consumer: self.config.delayed_stream.consumer_spec(),
            dead_letter_subject: self.config.delayed_stream.dead_letter_subject.clone(),
            requeue_backoff_max: self.config.delayed_stream.requeue_backoff_max(),
        };
        let service = WorkerService::new(
            self.broker.clone(),
            self.handlers.clone(),
            self.hooks.clone(),
            self.config.worker.clone(),
            options,
        );
        service.run(shutdown_rx).await?;
        Ok(())
    }

    async fn run_all(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("starting scheduler and worker services");

        let scheduler_rx = shutdown_rx.resubscribe();
        let worker_rx = shutdown_rx.resubscribe();
        drop(shutdown_rx);

        let scheduler = async {
            if self.config.scheduler.enabled {
                self.run_scheduler(scheduler_rx).await
            } else {
                info!("scheduler disabled by configuration");
                Ok(())
            }
        };
        let worker = async {
            if self.config.worker.enabled {
                self.run_worker(worker_rx).await
            } else {
                info!("worker disabled by configuration");
                Ok(())
            }
        };
        let (scheduler_result, worker_result) = tokio::join!(scheduler, worker);

        if let Err(e) = &scheduler_result {
            error!(error = %e, "scheduler service failed");
        }
        if let Err(e) = &worker_result {
            error!(error = %e, "worker service failed");
        }
        scheduler_result.and(worker_result)
    }

    /// Sanity accessor used by the provisioning path and tests.
    pub fn delayed_queue(&self) -> Arc<DelayedTaskQueue> {
        self.delayed.clone()
    }
}
