use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use taskq_core::config::ScheduleStoreConfig;
use taskq_core::errors::{Result, TaskQueueError};
use taskq_core::models::{ScheduleEntry, ScheduleOrigin, ScheduleSpec};

use super::ScheduleSource;

/// Stored wire form of an external entry. The hash field is the
/// handler name; `handler` inside the value, when present, must agree.
#[derive(Debug, Deserialize)]
struct StoredEntry {
    #[serde(default)]
    handler: Option<String>,
    spec: ScheduleSpec,
    #[serde(default)]
    args: serde_json::Value,
}

/// Schedule entries stored as JSON values in a Redis hash, mutable by
/// administrative action without redeploying workers. This source
/// only reads; concurrent mutation relies on Redis hash primitives.
pub struct RedisScheduleSource {
    client: redis::Client,
    key: String,
}

impl RedisScheduleSource {
    pub async fn connect(config: &ScheduleStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.clone())
            .map_err(|e| TaskQueueError::ScheduleStore(e.to_string()))?;

        // Ping the connection so a bad URL fails at startup.
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| TaskQueueError::ScheduleStore(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskQueueError::ScheduleStore(e.to_string()))?;

        info!(key = %config.key, "connected to schedule store");
        Ok(Self {
            client,
            key: config.key.clone(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| TaskQueueError::ScheduleStore(e.to_string()))
    }
}

#[async_trait]
impl ScheduleSource for RedisScheduleSource {
    fn origin(&self) -> ScheduleOrigin {
        ScheduleOrigin::External
    }

    async fn entries(&self) -> Result<Vec<ScheduleEntry>> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskQueueError::ScheduleStore(e.to_string()))?;

        let mut entries = Vec::with_capacity(raw.len());
        for (field, value) in raw {
            let stored: StoredEntry = match serde_json::from_str(&value) {
                Ok(stored) => stored,
                Err(e) => {
                    // A malformed entry is skipped, not fatal; the rest
                    // of the hash still schedules.
                    warn!(field = %field, error = %e, "skipping malformed schedule entry");
                    continue;
                }
            };
            let handler = stored.handler.unwrap_or_else(|| field.clone());
            if let Err(e) = stored.spec.validate() {
                warn!(handler = %handler, error = %e, "skipping invalid schedule spec");
                continue;
            }
            entries.push(ScheduleEntry::new(
                handler,
                stored.spec,
                stored.args,
                ScheduleOrigin::External,
            ));
        }
        debug!(count = entries.len(), "loaded external schedule entries");
        Ok(entries)
    }
}
