use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use taskq_broker::{DelayedTaskQueue, InMemoryBroker, TaskProducer};
use taskq_core::config::DelayedStreamConfig;
use taskq_core::models::Task;
use taskq_core::traits::broker::{Broker, ProvisionOutcome};

fn delayed_config() -> DelayedStreamConfig {
    DelayedStreamConfig {
        name: "delayed-tasks".to_string(),
        subject: "tasks.delayed".to_string(),
        durable_name: "test-delayed".to_string(),
        ack_wait_seconds: 5,
        requeue_backoff_max_seconds: 10,
        ..DelayedStreamConfig::default()
    }
}

fn queue() -> (Arc<InMemoryBroker>, DelayedTaskQueue) {
    let broker = Arc::new(InMemoryBroker::new());
    let queue = DelayedTaskQueue::new(broker.clone() as Arc<dyn Broker>, delayed_config());
    (broker, queue)
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let (_broker, queue) = queue();

    assert_eq!(queue.provision().await.unwrap(), ProvisionOutcome::Created);
    assert_eq!(
        queue.provision().await.unwrap(),
        ProvisionOutcome::AlreadyExists
    );
    assert_eq!(
        queue.provision().await.unwrap(),
        ProvisionOutcome::AlreadyExists
    );
}

#[tokio::test]
async fn test_enqueue_returns_task_id_and_record_survives() {
    let (broker, queue) = queue();
    queue.provision().await.unwrap();

    let task = Task::new("send_digest", serde_json::json!({"user_id": 42}));
    let id = queue.enqueue(&task).await.unwrap();
    assert_eq!(id, task.id);
    assert_eq!(broker.stream_depth("delayed-tasks").await.unwrap(), 1);

    let mut stream = queue.subscribe().await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    let received = Task::deserialize_bytes(&delivery.payload).unwrap();
    assert_eq!(received, task);
    delivery.ack().await.unwrap();
}

/// A record published ahead of its due time is delivered early,
/// requeued with bounded backoff, and only runs once it is due.
#[tokio::test]
async fn test_not_yet_due_record_is_requeued_until_due() {
    let (_broker, queue) = queue();
    queue.provision().await.unwrap();

    let not_before = Utc::now() + chrono::Duration::milliseconds(400);
    let task = Task::delayed("send_digest", serde_json::json!({}), not_before);
    queue.enqueue(&task).await.unwrap();

    let backoff_max = queue.config().requeue_backoff_max();
    let mut stream = queue.subscribe().await.unwrap();
    let mut requeues = 0u32;
    loop {
        let delivery = stream.next().await.unwrap().unwrap();
        let received = Task::deserialize_bytes(&delivery.payload).unwrap();
        let now = Utc::now();
        if received.is_due(now) {
            delivery.ack().await.unwrap();
            break;
        }
        let remaining = (received.not_before.unwrap() - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        delivery.nack(Some(remaining.min(backoff_max))).await.unwrap();
        requeues += 1;
        assert!(requeues < 50, "record never became due");
    }

    assert!(requeues >= 1, "first delivery should have arrived before the due time");
    assert!(Utc::now() >= not_before);
}

#[tokio::test]
async fn test_same_producer_same_subject_preserves_order() {
    let (_broker, queue) = queue();
    queue.provision().await.unwrap();

    for n in 0..10 {
        let task = Task::new("ordered", serde_json::json!({ "n": n }));
        queue.enqueue(&task).await.unwrap();
    }

    let mut stream = queue.subscribe().await.unwrap();
    for expected in 0..10 {
        let delivery = stream.next().await.unwrap().unwrap();
        let task = Task::deserialize_bytes(&delivery.payload).unwrap();
        assert_eq!(task.payload["n"], expected);
        delivery.ack().await.unwrap();
    }
}

#[tokio::test]
async fn test_producer_routes_immediate_and_delayed_sends() {
    let broker = Arc::new(InMemoryBroker::new());
    let delayed = Arc::new(DelayedTaskQueue::new(
        broker.clone() as Arc<dyn Broker>,
        delayed_config(),
    ));
    delayed.provision().await.unwrap();
    let producer = TaskProducer::new(broker.clone() as Arc<dyn Broker>, "tasks.main", delayed);

    let task = Task::new("send_digest", serde_json::json!({}));
    producer.send(&task).await.unwrap();
    // Implicit stream named after the subject backs the immediate send.
    assert_eq!(broker.stream_depth("tasks.main").await.unwrap(), 1);

    let not_before = Utc::now() + chrono::Duration::seconds(60);
    producer.send_delayed(&task, not_before).await.unwrap();
    assert_eq!(broker.stream_depth("delayed-tasks").await.unwrap(), 1);
}

#[tokio::test]
async fn test_delayed_send_stamps_not_before() {
    let broker = Arc::new(InMemoryBroker::new());
    let delayed = Arc::new(DelayedTaskQueue::new(
        broker.clone() as Arc<dyn Broker>,
        delayed_config(),
    ));
    delayed.provision().await.unwrap();
    let producer = TaskProducer::new(
        broker as Arc<dyn Broker>,
        "tasks.main",
        delayed.clone(),
    );

    let not_before = Utc::now() + chrono::Duration::seconds(90);
    let task = Task::new("send_digest", serde_json::json!({}));
    producer.send_delayed(&task, not_before).await.unwrap();

    let mut stream = delayed.subscribe().await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    let received = Task::deserialize_bytes(&delivery.payload).unwrap();
    assert_eq!(received.not_before, Some(not_before));
    delivery.ack().await.unwrap();
}
