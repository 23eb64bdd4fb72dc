pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, BrokerBackend, BrokerConfig, DelayedStreamConfig, LogsConfig, ScheduleStoreConfig,
    SchedulerConfig, WorkerConfig,
};
pub use errors::{Result, TaskQueueError};
pub use models::{ScheduleEntry, ScheduleOrigin, ScheduleSpec, Task};
pub use traits::{
    Acker, Broker, ConsumerSpec, Delivery, DeliveryStream, ProvisionOutcome, RetentionPolicy,
    StorageMode, StreamSpec,
};
