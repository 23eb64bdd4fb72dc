use async_trait::async_trait;

use taskq_core::errors::Result;
use taskq_core::models::{ScheduleEntry, ScheduleOrigin, ScheduleSpec};

use super::ScheduleSource;

/// Compiled-in schedule entries declared alongside handler
/// registration. Immutable once the process is up.
#[derive(Default)]
pub struct LabelScheduleSource {
    entries: Vec<ScheduleEntry>,
}

impl LabelScheduleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    /// Adds a label entry; the spec is validated at declaration so a
    /// bad expression fails at startup, not at fire time.
    pub fn add(
        &mut self,
        handler: impl Into<String>,
        spec: ScheduleSpec,
        args: serde_json::Value,
    ) -> Result<()> {
        spec.validate()?;
        self.entries.push(ScheduleEntry::new(
            handler,
            spec,
            args,
            ScheduleOrigin::Label,
        ));
        Ok(())
    }
}

#[async_trait]
impl ScheduleSource for LabelScheduleSource {
    fn origin(&self) -> ScheduleOrigin {
        ScheduleOrigin::Label
    }

    async fn entries(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.entries.clone())
    }
}
