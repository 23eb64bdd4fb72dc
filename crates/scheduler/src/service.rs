use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use taskq_broker::TaskProducer;
use taskq_core::config::SchedulerConfig;
use taskq_core::errors::Result;
use taskq_core::models::Task;

use crate::registry::{DueEntry, ScheduleRegistry};

/// Observable lifecycle of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Polls the schedule registry on a fixed interval and publishes a
/// task for every due entry.
///
/// A fire is recorded only after its publish succeeds, so a failed
/// publish is retried on the next tick and never aborts the remaining
/// due entries.
pub struct SchedulerService {
    registry: Arc<ScheduleRegistry>,
    producer: Arc<TaskProducer>,
    config: SchedulerConfig,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerService {
    pub fn new(
        registry: Arc<ScheduleRegistry>,
        producer: Arc<TaskProducer>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            producer,
            config,
            state: Arc::new(RwLock::new(SchedulerState::Starting)),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SchedulerState) {
        *self.state.write().await = state;
        debug!(?state, "scheduler state changed");
    }

    /// Runs until a shutdown signal arrives. A signal received while a
    /// tick is in flight waits for that tick's publishes to finish.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.set_state(SchedulerState::Running).await;
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.set_state(SchedulerState::Draining).await;
                    info!("scheduler draining, no further ticks");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once(Utc::now()).await;
                }
            }
        }

        self.set_state(SchedulerState::Stopped).await;
        info!("scheduler stopped");
        Ok(())
    }

    /// One scheduling pass at `now`. Returns the number of tasks
    /// published.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> usize {
        let due = self.registry.list_due(now).await;
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), "due schedule entries");

        let mut published = 0;
        for DueEntry { entry, fire_time } in due {
            let task = Task::new(entry.handler.clone(), entry.args.clone())
                .with_schedule_label(&entry.handler);

            // Due fires never lie in the future, so they always go
            // straight to the immediate subject.
            match self.producer.send(&task).await {
                Ok(task_id) => {
                    self.registry.mark_fired(&entry.handler, fire_time).await;
                    debug!(
                        handler = %entry.handler,
                        task_id = %task_id,
                        fire_time = %fire_time,
                        "scheduled task published"
                    );
                    published += 1;
                }
                Err(e) => {
                    // Unmarked, so the same fire comes back next tick.
                    warn!(handler = %entry.handler, error = %e, "publish failed, will retry next tick");
                }
            }
        }
        published
    }
}
