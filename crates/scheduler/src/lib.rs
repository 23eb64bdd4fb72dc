//! Schedule sources, the merged registry and the scheduler loop.

pub mod registry;
pub mod service;
pub mod sources;

pub use registry::{DueEntry, ScheduleRegistry};
pub use service::{SchedulerService, SchedulerState};
pub use sources::{LabelScheduleSource, RedisScheduleSource, ScheduleSource};
