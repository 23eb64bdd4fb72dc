use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskq_core::errors::{Result, TaskQueueError};
use taskq_core::traits::broker::{
    Acker, Broker, ConsumerSpec, Delivery, DeliveryStream, ProvisionOutcome, RetentionPolicy,
    StorageMode, StreamSpec,
};

/// In-process broker backed by tokio primitives.
///
/// Used for embedded runs and tests. Stream records live in an
/// append-only log per stream; durable consumer cursors are held
/// broker-side, so resubscribing under the same durable name resumes
/// where the previous subscription left off. File storage degrades to
/// process lifetime.
pub struct InMemoryBroker {
    streams: Arc<RwLock<HashMap<String, Arc<StreamHandle>>>>,
    /// Bound on unconsumed records per stream; publishing past it
    /// fails with `Backpressure`.
    max_records_per_stream: usize,
}

struct StreamHandle {
    state: Mutex<StreamState>,
    notify: Notify,
}

struct StreamState {
    spec: StreamSpec,
    next_seq: u64,
    records: BTreeMap<u64, StoredRecord>,
    consumers: HashMap<String, ConsumerState>,
}

struct StoredRecord {
    subject: String,
    payload: Vec<u8>,
}

/// Server-side durable cursor: position plus unacknowledged
/// deliveries with their visibility deadlines.
struct ConsumerState {
    next_seq: u64,
    pending: BTreeMap<u64, PendingDelivery>,
}

struct PendingDelivery {
    visible_at: Instant,
    /// Deliveries handed out so far for this record.
    attempt: u32,
}

const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Matches a NATS-style subject pattern (`*` per token, trailing `>`).
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(max_records_per_stream: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            max_records_per_stream,
        }
    }

    async fn find_stream_for_subject(&self, subject: &str) -> Option<Arc<StreamHandle>> {
        let streams = self.streams.read().await;
        for handle in streams.values() {
            let state = handle.state.lock().await;
            if state.spec.subjects.iter().any(|p| subject_matches(p, subject)) {
                drop(state);
                return Some(handle.clone());
            }
        }
        None
    }

    /// Publishing to a subject no stream covers creates an implicit
    /// volatile stream named after the subject, mirroring queue
    /// auto-creation on first use.
    async fn implicit_stream(&self, subject: &str) -> Result<Arc<StreamHandle>> {
        let spec = StreamSpec {
            name: subject.to_string(),
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::Limits,
            storage: StorageMode::Memory,
            ack_wait: Duration::from_secs(30),
            dead_letter_subject: None,
        };
        debug!(subject, "creating implicit stream");
        self.ensure_stream(&spec).await?;
        let streams = self.streams.read().await;
        streams
            .get(subject)
            .cloned()
            .ok_or_else(|| TaskQueueError::Internal("implicit stream vanished".to_string()))
    }

    /// Number of retained records in a stream. Test and inspection
    /// helper, not part of the broker contract.
    pub async fn stream_depth(&self, name: &str) -> Result<usize> {
        let streams = self.streams.read().await;
        let handle = streams
            .get(name)
            .ok_or_else(|| TaskQueueError::Internal(format!("unknown stream: {name}")))?;
        let state = handle.state.lock().await;
        Ok(state.records.len())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<ProvisionOutcome> {
        spec.validate()?;
        let mut streams = self.streams.write().await;

        if let Some(existing) = streams.get(&spec.name) {
            let state = existing.state.lock().await;
            if state.spec == *spec {
                debug!(stream = %spec.name, "stream already exists");
                return Ok(ProvisionOutcome::AlreadyExists);
            }
            return Err(TaskQueueError::StreamProvision(format!(
                "stream {} already exists with different configuration",
                spec.name
            )));
        }

        // Stream subjects must be disjoint across streams.
        for (name, handle) in streams.iter() {
            let state = handle.state.lock().await;
            for subject in &spec.subjects {
                if state.spec.subjects.iter().any(|p| subject_matches(p, subject)) {
                    return Err(TaskQueueError::Configuration(format!(
                        "subject {subject} already claimed by stream {name}"
                    )));
                }
            }
        }

        streams.insert(
            spec.name.clone(),
            Arc::new(StreamHandle {
                state: Mutex::new(StreamState {
                    spec: spec.clone(),
                    next_seq: 1,
                    records: BTreeMap::new(),
                    consumers: HashMap::new(),
                }),
                notify: Notify::new(),
            }),
        );
        info!(stream = %spec.name, subjects = ?spec.subjects, "stream created");
        Ok(ProvisionOutcome::Created)
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let handle = match self.find_stream_for_subject(subject).await {
            Some(handle) => handle,
            None => self.implicit_stream(subject).await?,
        };

        {
            let mut state = handle.state.lock().await;
            if state.records.len() >= self.max_records_per_stream {
                warn!(subject, "stream buffer full, rejecting publish");
                return Err(TaskQueueError::Backpressure {
                    subject: subject.to_string(),
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.records.insert(
                seq,
                StoredRecord {
                    subject: subject.to_string(),
                    payload: payload.to_vec(),
                },
            );
        }
        handle.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Box<dyn DeliveryStream>> {
        let streams = self.streams.read().await;
        let handle = streams.get(&spec.stream).cloned().ok_or_else(|| {
            TaskQueueError::Connection(format!("stream {} does not exist", spec.stream))
        })?;
        drop(streams);

        {
            let mut state = handle.state.lock().await;
            state
                .consumers
                .entry(spec.durable_name.clone())
                .or_insert_with(|| ConsumerState {
                    next_seq: 1,
                    pending: BTreeMap::new(),
                });
        }
        debug!(stream = %spec.stream, durable = %spec.durable_name, "durable consumer bound");

        Ok(Box::new(InMemoryDeliveryStream {
            handle,
            spec: spec.clone(),
        }))
    }
}

struct InMemoryDeliveryStream {
    handle: Arc<StreamHandle>,
    spec: ConsumerSpec,
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let wait_hint = {
                let mut state = self.handle.state.lock().await;
                match next_visible(&mut state, &self.spec) {
                    NextDelivery::Ready { seq, attempt } => {
                        let record = &state.records[&seq];
                        let delivery = Delivery::new(
                            record.subject.clone(),
                            record.payload.clone(),
                            attempt,
                            Box::new(InMemoryAcker {
                                handle: self.handle.clone(),
                                durable: self.spec.durable_name.clone(),
                                seq,
                            }),
                        );
                        return Ok(Some(delivery));
                    }
                    NextDelivery::WaitUntil(deadline) => Some(deadline),
                    NextDelivery::WaitForPublish => None,
                }
            };

            match wait_hint {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.handle.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.handle.notify.notified().await,
            }
        }
    }
}

enum NextDelivery {
    Ready { seq: u64, attempt: u32 },
    WaitUntil(Instant),
    WaitForPublish,
}

/// Picks the lowest-sequence visible record for a consumer: a pending
/// redelivery whose visibility deadline passed, or the next record the
/// cursor has not seen yet. Marks the chosen record in flight until
/// `ack_wait` expires.
fn next_visible(state: &mut StreamState, spec: &ConsumerSpec) -> NextDelivery {
    let now = Instant::now();
    let ack_wait = spec.ack_wait;

    let StreamState {
        records, consumers, ..
    } = state;
    let consumer = match consumers.get_mut(&spec.durable_name) {
        Some(consumer) => consumer,
        None => return NextDelivery::WaitForPublish,
    };

    // Drop pending entries whose record was removed by retention.
    let removed: Vec<u64> = consumer
        .pending
        .keys()
        .copied()
        .filter(|seq| !records.contains_key(seq))
        .collect();
    for seq in removed {
        consumer.pending.remove(&seq);
    }

    // Redeliveries first, lowest sequence wins.
    let redelivery = consumer
        .pending
        .iter()
        .find(|(_, pd)| pd.visible_at <= now)
        .map(|(seq, pd)| (*seq, pd.attempt));
    if let Some((seq, prior_attempts)) = redelivery {
        let attempt = prior_attempts + 1;
        consumer.pending.insert(
            seq,
            PendingDelivery {
                visible_at: now + ack_wait,
                attempt,
            },
        );
        return NextDelivery::Ready { seq, attempt };
    }

    // Then the next unseen record matching the consumer's subject.
    let fresh = records
        .range(consumer.next_seq..)
        .find(|(_, record)| subject_matches(&spec.subject, &record.subject))
        .map(|(seq, _)| *seq);
    if let Some(seq) = fresh {
        consumer.next_seq = seq + 1;
        consumer.pending.insert(
            seq,
            PendingDelivery {
                visible_at: now + ack_wait,
                attempt: 1,
            },
        );
        return NextDelivery::Ready { seq, attempt: 1 };
    }

    match consumer.pending.values().map(|pd| pd.visible_at).min() {
        Some(deadline) => NextDelivery::WaitUntil(deadline),
        None => NextDelivery::WaitForPublish,
    }
}

struct InMemoryAcker {
    handle: Arc<StreamHandle>,
    durable: String,
    seq: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.handle.state.lock().await;
        if let Some(consumer) = state.consumers.get_mut(&self.durable) {
            consumer.pending.remove(&self.seq);
        }
        // Work-queue retention removes the record on first ack; an
        // acked record is never redelivered to this consumer group.
        if state.spec.retention == RetentionPolicy::WorkQueue {
            state.records.remove(&self.seq);
        }
        self.handle.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<()> {
        let mut state = self.handle.state.lock().await;
        if let Some(consumer) = state.consumers.get_mut(&self.durable) {
            if let Some(pd) = consumer.pending.get_mut(&self.seq) {
                pd.visible_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
            }
        }
        self.handle.notify.notify_waiters();
        Ok(())
    }
}
