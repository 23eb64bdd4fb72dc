use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskQueueError};
use crate::traits::broker::{ConsumerSpec, RetentionPolicy, StorageMode, StreamSpec};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub level: String,
    /// One of `json` or `pretty`.
    pub format: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LogsConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.format.as_str(), "json" | "pretty") {
            return Err(TaskQueueError::Configuration(format!(
                "unsupported log format: {}",
                self.format
            )));
        }
        Ok(())
    }
}

/// Broker backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    #[default]
    Nats,
    /// Volatile in-process backend for embedded runs and tests.
    Memory,
}

/// Broker transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub servers: Vec<String>,
    /// Subject for immediate task dispatch.
    pub task_subject: String,
    /// Stream backing the immediate subject.
    pub task_stream: String,
    pub task_durable_name: String,
    /// Bound on unacknowledged in-flight publishes before publishing
    /// fails loudly instead of buffering further.
    pub max_inflight_publishes: usize,
    pub connect_max_retries: u32,
    pub connect_retry_delay_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Nats,
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            task_subject: "tasks.main".to_string(),
            task_stream: "tasks".to_string(),
            task_durable_name: "taskq-workers".to_string(),
            max_inflight_publishes: 256,
            connect_max_retries: 5,
            connect_retry_delay_seconds: 2,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == BrokerBackend::Nats
            && (self.servers.is_empty() || self.servers.iter().any(|s| s.is_empty()))
        {
            return Err(TaskQueueError::Configuration(
                "broker.servers must list at least one non-empty address".to_string(),
            ));
        }
        if self.task_subject.is_empty() || self.task_stream.is_empty() {
            return Err(TaskQueueError::Configuration(
                "broker.task_subject and broker.task_stream must not be empty".to_string(),
            ));
        }
        if self.task_durable_name.is_empty() {
            return Err(TaskQueueError::Configuration(
                "broker.task_durable_name must not be empty".to_string(),
            ));
        }
        if self.max_inflight_publishes == 0 {
            return Err(TaskQueueError::Configuration(
                "broker.max_inflight_publishes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_seconds)
    }
}

/// Delayed-delivery stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedStreamConfig {
    pub name: String,
    pub subject: String,
    pub durable_name: String,
    pub dead_letter_subject: String,
    pub retention: RetentionPolicy,
    pub storage: StorageMode,
    pub ack_wait_seconds: u64,
    /// Upper bound on the requeue backoff used while a record is not
    /// yet due.
    pub requeue_backoff_max_seconds: u64,
}

impl Default for DelayedStreamConfig {
    fn default() -> Self {
        Self {
            name: "delayed-tasks".to_string(),
            subject: "tasks.delayed".to_string(),
            durable_name: "taskq-delayed".to_string(),
            dead_letter_subject: "tasks.dead".to_string(),
            retention: RetentionPolicy::Limits,
            storage: StorageMode::File,
            ack_wait_seconds: 30,
            requeue_backoff_max_seconds: 10,
        }
    }
}

impl DelayedStreamConfig {
    pub fn validate(&self) -> Result<()> {
        self.stream_spec().validate()?;
        if self.durable_name.is_empty() {
            return Err(TaskQueueError::Configuration(
                "delayed_stream.durable_name must not be empty".to_string(),
            ));
        }
        if self.ack_wait_seconds == 0 {
            return Err(TaskQueueError::Configuration(
                "delayed_stream.ack_wait_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stream_spec(&self) -> StreamSpec {
        StreamSpec {
            name: self.name.clone(),
            subjects: vec![self.subject.clone()],
            retention: self.retention,
            storage: self.storage,
            ack_wait: Duration::from_secs(self.ack_wait_seconds),
            dead_letter_subject: Some(self.dead_letter_subject.clone()),
        }
    }

    pub fn consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            stream: self.name.clone(),
            subject: self.subject.clone(),
            durable_name: self.durable_name.clone(),
            ack_wait: Duration::from_secs(self.ack_wait_seconds),
        }
    }

    pub fn requeue_backoff_max(&self) -> Duration {
        Duration::from_secs(self.requeue_backoff_max_seconds)
    }
}

/// External schedule store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleStoreConfig {
    pub enabled: bool,
    pub url: String,
    /// Hash key the stored schedule entries live under.
    pub key: String,
}

impl Default for ScheduleStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379/0".to_string(),
            key: "taskq:schedules".to_string(),
        }
    }
}

impl ScheduleStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(TaskQueueError::Configuration(format!(
                "schedule_store.url must be a redis:// or rediss:// address, got {}",
                self.url
            )));
        }
        if self.key.is_empty() {
            return Err(TaskQueueError::Configuration(
                "schedule_store.key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.poll_interval_seconds == 0 {
            return Err(TaskQueueError::Configuration(
                "scheduler.poll_interval_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Worker dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub max_concurrent_tasks: usize,
    /// Handler attempts before a failing task is dead-lettered.
    pub max_retries: u32,
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: "worker-001".to_string(),
            max_concurrent_tasks: 8,
            max_retries: 3,
            shutdown_grace_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.worker_id.is_empty() {
            return Err(TaskQueueError::Configuration(
                "worker.worker_id must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(TaskQueueError::Configuration(
                "worker.max_concurrent_tasks must be greater than zero".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(TaskQueueError::Configuration(
                "worker.max_retries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Typed application configuration consumed by every process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logs: LogsConfig,
    pub broker: BrokerConfig,
    pub delayed_stream: DelayedStreamConfig,
    pub schedule_store: ScheduleStoreConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Loads configuration in layers: defaults, then an optional TOML
    /// file, then `TASKQ_` environment overrides. Malformed or missing
    /// required fields fail fast at process start.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(TaskQueueError::Configuration(format!(
                    "config file not found: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            for path in ["config/taskq.toml", "taskq.toml", "/etc/taskq/config.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TaskQueueError::Configuration(format!("failed to load config: {e}")))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(|e| TaskQueueError::Configuration(format!("invalid config: {e}")))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        self.logs.validate()?;
        self.broker.validate()?;
        self.delayed_stream.validate()?;
        self.schedule_store.validate()?;
        self.scheduler.validate()?;
        self.worker.validate()?;
        Ok(())
    }

    /// Stream backing the immediate task subject. Shares the delayed
    /// stream's retention and ack-wait so both paths behave alike.
    pub fn task_stream_spec(&self) -> StreamSpec {
        StreamSpec {
            name: self.broker.task_stream.clone(),
            subjects: vec![self.broker.task_subject.clone()],
            retention: self.delayed_stream.retention,
            storage: self.delayed_stream.storage,
            ack_wait: Duration::from_secs(self.delayed_stream.ack_wait_seconds),
            dead_letter_subject: Some(self.delayed_stream.dead_letter_subject.clone()),
        }
    }

    pub fn task_consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            stream: self.broker.task_stream.clone(),
            subject: self.broker.task_subject.clone(),
            durable_name: self.broker.task_durable_name.clone(),
            ack_wait: Duration::from_secs(self.delayed_stream.ack_wait_seconds),
        }
    }
}
