use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use taskq_core::models::{ScheduleEntry, ScheduleOrigin};

use crate::sources::ScheduleSource;

/// An entry whose fire time has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct DueEntry {
    pub entry: ScheduleEntry,
    pub fire_time: DateTime<Utc>,
}

/// Merged view over the configured schedule sources.
///
/// Owns the per-entry last-fired record, keyed by handler name. The
/// record only advances, so a fire reported once is never reported
/// again, and `mark_fired` with an older timestamp is a no-op.
pub struct ScheduleRegistry {
    sources: Vec<Arc<dyn ScheduleSource>>,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ScheduleRegistry {
    pub fn new(sources: Vec<Arc<dyn ScheduleSource>>) -> Self {
        Self {
            sources,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Entries from every reachable source, external entries
    /// overriding label entries that target the same handler. A
    /// failing source degrades the view to the remaining sources.
    async fn merged_entries(&self) -> Vec<ScheduleEntry> {
        let mut merged: HashMap<String, ScheduleEntry> = HashMap::new();
        for source in &self.sources {
            let entries = match source.entries().await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(origin = ?source.origin(), error = %e, "schedule source unavailable, degrading");
                    continue;
                }
            };
            for entry in entries {
                match merged.get(&entry.handler) {
                    Some(existing)
                        if existing.origin == ScheduleOrigin::External
                            && entry.origin == ScheduleOrigin::Label =>
                    {
                        debug!(handler = %entry.handler, "label entry shadowed by external entry");
                    }
                    _ => {
                        merged.insert(entry.handler.clone(), entry);
                    }
                }
            }
        }
        let mut entries: Vec<ScheduleEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| a.handler.cmp(&b.handler));
        entries
    }

    /// Entries due at `reference`, ordered by handler name. At most
    /// one fire per entry per call; a missed slot catches up on the
    /// next call.
    pub async fn list_due(&self, reference: DateTime<Utc>) -> Vec<DueEntry> {
        let entries = self.merged_entries().await;
        let last_fired = self.last_fired.lock().await;

        let mut due = Vec::new();
        for entry in entries {
            let last = last_fired.get(&entry.handler).copied();
            match entry.due_fire(last, reference) {
                Ok(Some(fire_time)) => due.push(DueEntry { entry, fire_time }),
                Ok(None) => {}
                Err(e) => {
                    warn!(handler = %entry.handler, error = %e, "skipping unevaluable schedule entry");
                }
            }
        }
        due
    }

    /// Records a fire for `handler`. The record never moves backwards.
    pub async fn mark_fired(&self, handler: &str, fire_time: DateTime<Utc>) {
        let mut last_fired = self.last_fired.lock().await;
        match last_fired.get(handler) {
            Some(existing) if *existing >= fire_time => {}
            _ => {
                last_fired.insert(handler.to_string(), fire_time);
            }
        }
    }

    pub async fn last_fired(&self, handler: &str) -> Option<DateTime<Utc>> {
        self.last_fired.lock().await.get(handler).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    use taskq_core::errors::{Result, TaskQueueError};
    use taskq_core::models::ScheduleSpec;

    use crate::sources::LabelScheduleSource;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct StaticSource {
        origin: ScheduleOrigin,
        entries: Vec<ScheduleEntry>,
    }

    #[async_trait]
    impl ScheduleSource for StaticSource {
        fn origin(&self) -> ScheduleOrigin {
            self.origin
        }

        async fn entries(&self) -> Result<Vec<ScheduleEntry>> {
            Ok(self.entries.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ScheduleSource for FailingSource {
        fn origin(&self) -> ScheduleOrigin {
            ScheduleOrigin::External
        }

        async fn entries(&self) -> Result<Vec<ScheduleEntry>> {
            Err(TaskQueueError::ScheduleStore("connection reset".to_string()))
        }
    }

    fn label_entry(handler: &str, interval: u64) -> ScheduleEntry {
        ScheduleEntry::new(
            handler,
            ScheduleSpec::every(interval, at(0)),
            json!({}),
            ScheduleOrigin::Label,
        )
    }

    fn external_entry(handler: &str, interval: u64) -> ScheduleEntry {
        ScheduleEntry::new(
            handler,
            ScheduleSpec::every(interval, at(0)),
            json!({"source": "external"}),
            ScheduleOrigin::External,
        )
    }

    #[tokio::test]
    async fn test_external_overrides_label_for_same_handler() {
        let label = Arc::new(LabelScheduleSource::with_entries(vec![
            label_entry("send_digest", 60),
            label_entry("cleanup", 60),
        ]));
        let external = Arc::new(StaticSource {
            origin: ScheduleOrigin::External,
            entries: vec![external_entry("send_digest", 30)],
        });
        let registry = ScheduleRegistry::new(vec![label, external]);

        let due = registry.list_due(at(0)).await;
        assert_eq!(due.len(), 2);
        // ordered by handler name
        assert_eq!(due[0].entry.handler, "cleanup");
        assert_eq!(due[0].entry.origin, ScheduleOrigin::Label);
        assert_eq!(due[1].entry.handler, "send_digest");
        assert_eq!(due[1].entry.origin, ScheduleOrigin::External);
        assert_eq!(due[1].entry.args, json!({"source": "external"}));
    }

    #[tokio::test]
    async fn test_external_wins_regardless_of_source_order() {
        let label = Arc::new(LabelScheduleSource::with_entries(vec![label_entry(
            "send_digest",
            60,
        )]));
        let external = Arc::new(StaticSource {
            origin: ScheduleOrigin::External,
            entries: vec![external_entry("send_digest", 30)],
        });
        let registry = ScheduleRegistry::new(vec![external, label]);

        let due = registry.list_due(at(0)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].entry.origin, ScheduleOrigin::External);
    }

    #[tokio::test]
    async fn test_failing_source_degrades_to_remaining_sources() {
        let label = Arc::new(LabelScheduleSource::with_entries(vec![label_entry(
            "send_digest",
            60,
        )]));
        let registry = ScheduleRegistry::new(vec![Arc::new(FailingSource), label]);

        let due = registry.list_due(at(0)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].entry.handler, "send_digest");
    }

    #[tokio::test]
    async fn test_marked_fire_is_not_reported_again() {
        let label = Arc::new(LabelScheduleSource::with_entries(vec![label_entry(
            "send_digest",
            60,
        )]));
        let registry = ScheduleRegistry::new(vec![label]);

        let due = registry.list_due(at(0)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, at(0));
        registry.mark_fired("send_digest", at(0)).await;

        assert!(registry.list_due(at(0)).await.is_empty());
        assert!(registry.list_due(at(59)).await.is_empty());

        let due = registry.list_due(at(60)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, at(60));
    }

    #[tokio::test]
    async fn test_unmarked_fire_is_reported_again_next_tick() {
        // A failed publish leaves the record unmarked; the same fire
        // must come back on the following poll.
        let label = Arc::new(LabelScheduleSource::with_entries(vec![label_entry(
            "send_digest",
            60,
        )]));
        let registry = ScheduleRegistry::new(vec![label]);

        let first = registry.list_due(at(0)).await;
        let second = registry.list_due(at(5)).await;
        assert_eq!(first[0].fire_time, second[0].fire_time);
    }

    #[tokio::test]
    async fn test_mark_fired_never_moves_backwards() {
        let registry = ScheduleRegistry::new(vec![]);
        registry.mark_fired("send_digest", at(120)).await;
        registry.mark_fired("send_digest", at(60)).await;
        assert_eq!(registry.last_fired("send_digest").await, Some(at(120)));
    }
}
