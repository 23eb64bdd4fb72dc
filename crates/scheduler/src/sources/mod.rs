use async_trait::async_trait;

use taskq_core::errors::Result;
use taskq_core::models::{ScheduleEntry, ScheduleOrigin};

mod label;
mod redis;

pub use label::LabelScheduleSource;
pub use redis::RedisScheduleSource;

/// A provider of schedule entries.
///
/// Sources are read-only from the registry's point of view; mutation
/// happens out of band (code for label entries, administrative writes
/// for external ones).
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    fn origin(&self) -> ScheduleOrigin;

    /// Current entries. A failure here degrades the merged view to
    /// the remaining sources; it never halts scheduling.
    async fn entries(&self) -> Result<Vec<ScheduleEntry>>;
}
