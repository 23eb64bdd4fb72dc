use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use taskq_broker::{DelayedTaskQueue, InMemoryBroker, TaskProducer};
use taskq_core::config::{DelayedStreamConfig, SchedulerConfig};
use taskq_core::errors::{Result, TaskQueueError};
use taskq_core::models::{ScheduleSpec, Task};
use taskq_core::traits::broker::{
    Broker, ConsumerSpec, DeliveryStream, ProvisionOutcome, StreamSpec,
};
use taskq_scheduler::{LabelScheduleSource, ScheduleRegistry, SchedulerService, SchedulerState};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn service_with(
    entries: Vec<(&str, u64)>,
    anchor: DateTime<Utc>,
) -> (Arc<InMemoryBroker>, SchedulerService) {
    let broker = Arc::new(InMemoryBroker::new());
    let delayed = Arc::new(DelayedTaskQueue::new(
        broker.clone() as Arc<dyn Broker>,
        DelayedStreamConfig::default(),
    ));
    let producer = Arc::new(TaskProducer::new(
        broker.clone() as Arc<dyn Broker>,
        "tasks.main",
        delayed,
    ));

    let mut label = LabelScheduleSource::new();
    for (handler, interval) in entries {
        label
            .add(handler, ScheduleSpec::every(interval, anchor), json!({}))
            .unwrap();
    }
    let registry = Arc::new(ScheduleRegistry::new(vec![Arc::new(label)]));
    let service = SchedulerService::new(registry, producer, SchedulerConfig::default());
    (broker, service)
}

/// A 60-second cadence observed by 5-second polls over three minutes
/// produces exactly three tasks, no matter how often the loop polls.
#[tokio::test]
async fn test_sixty_second_cadence_publishes_exactly_three_tasks() {
    let (broker, service) = service_with(vec![("send_digest", 60)], at(0));

    let mut published = 0;
    let mut t = 0;
    while t < 180 {
        published += service.poll_once(at(t)).await;
        t += 5;
    }

    assert_eq!(published, 3);
    assert_eq!(broker.stream_depth("tasks.main").await.unwrap(), 3);
    // Due fires go straight to the immediate subject; the delayed
    // stream is never touched by the scheduler.
    assert!(broker.stream_depth("delayed-tasks").await.is_err());
}

#[tokio::test]
async fn test_published_task_carries_schedule_label_and_args() {
    let broker = Arc::new(InMemoryBroker::new());
    let delayed = Arc::new(DelayedTaskQueue::new(
        broker.clone() as Arc<dyn Broker>,
        DelayedStreamConfig::default(),
    ));
    let producer = Arc::new(TaskProducer::new(
        broker.clone() as Arc<dyn Broker>,
        "tasks.main",
        delayed,
    ));

    let mut label = LabelScheduleSource::new();
    label
        .add(
            "send_digest",
            ScheduleSpec::every(60, at(0)),
            json!({"user_id": 7}),
        )
        .unwrap();
    let registry = Arc::new(ScheduleRegistry::new(vec![Arc::new(label)]));
    let service = SchedulerService::new(registry, producer, SchedulerConfig::default());

    assert_eq!(service.poll_once(at(0)).await, 1);

    let mut stream = broker
        .subscribe(&ConsumerSpec {
            stream: "tasks.main".to_string(),
            subject: "tasks.main".to_string(),
            durable_name: "inspector".to_string(),
            ack_wait: std::time::Duration::from_secs(5),
        })
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    let task = Task::deserialize_bytes(&delivery.payload).unwrap();
    assert_eq!(task.handler, "send_digest");
    assert_eq!(task.schedule_label.as_deref(), Some("send_digest"));
    assert_eq!(task.payload, json!({"user_id": 7}));
    delivery.ack().await.unwrap();
}

/// Publishes fail a fixed number of times, then succeed.
struct FlakyBroker {
    inner: InMemoryBroker,
    failures_left: AtomicU32,
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<ProvisionOutcome> {
        self.inner.ensure_stream(spec).await
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TaskQueueError::publish(subject, "transport down"));
        }
        self.inner.publish(subject, payload).await
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Box<dyn DeliveryStream>> {
        self.inner.subscribe(spec).await
    }
}

#[tokio::test]
async fn test_failed_publish_is_retried_next_tick_without_duplication() {
    let broker = Arc::new(FlakyBroker {
        inner: InMemoryBroker::new(),
        failures_left: AtomicU32::new(1),
    });
    let delayed = Arc::new(DelayedTaskQueue::new(
        broker.clone() as Arc<dyn Broker>,
        DelayedStreamConfig::default(),
    ));
    let producer = Arc::new(TaskProducer::new(
        broker.clone() as Arc<dyn Broker>,
        "tasks.main",
        delayed,
    ));

    let mut label = LabelScheduleSource::new();
    label
        .add("send_digest", ScheduleSpec::every(60, at(0)), json!({}))
        .unwrap();
    let registry = Arc::new(ScheduleRegistry::new(vec![Arc::new(label)]));
    let service = SchedulerService::new(registry, producer, SchedulerConfig::default());

    // First tick fails, fire stays unrecorded.
    assert_eq!(service.poll_once(at(0)).await, 0);
    // Next tick retries the same fire and succeeds, once.
    assert_eq!(service.poll_once(at(5)).await, 1);
    assert_eq!(service.poll_once(at(10)).await, 0);
    assert_eq!(broker.inner.stream_depth("tasks.main").await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_entry_does_not_abort_remaining_entries() {
    let broker = Arc::new(FlakyBroker {
        inner: InMemoryBroker::new(),
        failures_left: AtomicU32::new(1),
    });
    let delayed = Arc::new(DelayedTaskQueue::new(
        broker.clone() as Arc<dyn Broker>,
        DelayedStreamConfig::default(),
    ));
    let producer = Arc::new(TaskProducer::new(
        broker.clone() as Arc<dyn Broker>,
        "tasks.main",
        delayed,
    ));

    let mut label = LabelScheduleSource::new();
    label
        .add("cleanup", ScheduleSpec::every(60, at(0)), json!({}))
        .unwrap();
    label
        .add("send_digest", ScheduleSpec::every(60, at(0)), json!({}))
        .unwrap();
    let registry = Arc::new(ScheduleRegistry::new(vec![Arc::new(label)]));
    let service = SchedulerService::new(registry, producer, SchedulerConfig::default());

    // "cleanup" fails (first publish), "send_digest" still goes out.
    assert_eq!(service.poll_once(at(0)).await, 1);
    // "cleanup" catches up on the next tick.
    assert_eq!(service.poll_once(at(5)).await, 1);
    assert_eq!(broker.inner.stream_depth("tasks.main").await.unwrap(), 2);
}

#[tokio::test]
async fn test_shutdown_transitions_through_draining_to_stopped() {
    let (_broker, service) = service_with(vec![("send_digest", 60)], at(0));
    let service = Arc::new(service);
    assert_eq!(service.state().await, SchedulerState::Starting);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run(shutdown_rx).await })
    };

    // Wait for the loop to come up.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(service.state().await, SchedulerState::Running);

    shutdown_tx.send(()).unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(service.state().await, SchedulerState::Stopped);
}
