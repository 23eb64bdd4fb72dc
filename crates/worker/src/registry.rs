use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use taskq_core::errors::{Result, TaskQueueError};
use taskq_core::models::{ScheduleEntry, ScheduleOrigin, ScheduleSpec, Task};

use crate::context::WorkerContext;

/// A named unit of work.
///
/// Delivery is at-least-once, so handlers must be idempotent or
/// deduplicate by `task.id`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, context: &WorkerContext, task: &Task) -> Result<()>;
}

/// Builds worker resources around the dispatch loop. `on_startup`
/// runs exactly once before the first delivery, `on_shutdown` exactly
/// once after draining, also on signal-triggered shutdown.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_startup(&self, context: &mut WorkerContext) -> Result<()>;
    async fn on_shutdown(&self, context: &WorkerContext) -> Result<()>;
}

/// Name-to-handler dispatch table, plus the compiled-in schedule
/// entries declared next to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    schedule_entries: Vec<ScheduleEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Registers a handler together with its recurring schedule. The
    /// spec is validated here so a bad expression fails at startup.
    pub fn register_scheduled(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        spec: ScheduleSpec,
        args: serde_json::Value,
    ) -> Result<()> {
        spec.validate()?;
        let name = name.into();
        self.schedule_entries.push(ScheduleEntry::new(
            name.clone(),
            spec,
            args,
            ScheduleOrigin::Label,
        ));
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| TaskQueueError::HandlerNotFound {
                handler: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Entries to feed the label schedule source.
    pub fn schedule_entries(&self) -> &[ScheduleEntry] {
        &self.schedule_entries
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
