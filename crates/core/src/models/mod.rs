pub mod schedule;
pub mod task;

pub use schedule::{ScheduleEntry, ScheduleOrigin, ScheduleSpec};
pub use task::Task;
