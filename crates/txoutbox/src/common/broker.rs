//! Broker producer seam
//!
//! The relay pipelines sends: it submits a whole batch, then awaits the
//! acknowledgements in submission order. [`DeliveryHandle`] separates the
//! two halves so any async client can sit behind [`BrokerProducer`].
//! [`MemoryBroker`] is the in-process implementation used by tests.

use crate::common::error::{OutboxError, Result};
use crate::common::types::{MessageHeader, OutboxMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{oneshot, RwLock};

/// One record handed to the broker producer.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<MessageHeader>,
    pub value: Bytes,
}

impl BrokerRecord {
    /// Build a record from a decoded outbox message.
    pub fn from_message(message: &OutboxMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            partition: message.partition,
            key: message.key.clone(),
            timestamp: message.timestamp,
            headers: message.headers.clone(),
            value: message.value.clone(),
        }
    }
}

/// Broker-assigned coordinates of an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAck {
    pub partition: i32,
    pub offset: i64,
}

/// Resolves once the broker acknowledges or rejects one record.
pub struct DeliveryHandle {
    rx: oneshot::Receiver<Result<RecordAck>>,
}

/// Completion side of a [`DeliveryHandle`], held by the producer.
pub struct DeliveryCompletion {
    tx: oneshot::Sender<Result<RecordAck>>,
}

impl DeliveryCompletion {
    /// Resolve the paired handle. Ignores a handle that is already gone.
    pub fn complete(self, result: Result<RecordAck>) {
        let _ = self.tx.send(result);
    }
}

impl DeliveryHandle {
    /// A handle plus the completion the producer resolves later.
    pub fn pending() -> (DeliveryCompletion, DeliveryHandle) {
        let (tx, rx) = oneshot::channel();
        (DeliveryCompletion { tx }, DeliveryHandle { rx })
    }

    /// A handle that is already resolved.
    pub fn resolved(result: Result<RecordAck>) -> DeliveryHandle {
        let (completion, handle) = Self::pending();
        completion.complete(result);
        handle
    }

    /// Wait for the acknowledgement. A dropped completion counts as a
    /// failed send.
    pub async fn wait(self) -> Result<RecordAck> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(OutboxError::broker_send("producer dropped the delivery")),
        }
    }
}

/// Asynchronous broker producer.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Queue one record. The returned handle resolves when the broker
    /// acknowledges it; submission order fixes the send order.
    async fn submit(&self, record: BrokerRecord) -> Result<DeliveryHandle>;
}

/// A record accepted by [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct DeliveredRecord {
    pub record: BrokerRecord,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Default)]
struct BrokerState {
    /// topic -> partition -> append log
    topics: HashMap<String, Vec<Vec<DeliveredRecord>>>,
}

/// In-process broker with Kafka-style placement.
///
/// Explicit partitions are honored, keyed records hash to a stable
/// partition, unkeyed records round-robin. Offsets ascend per partition.
pub struct MemoryBroker {
    partitions: i32,
    state: RwLock<BrokerState>,
    round_robin: AtomicUsize,
    fail_next: AtomicUsize,
    delivered: AtomicUsize,
}

impl MemoryBroker {
    /// Create a broker whose topics all have `partitions` partitions.
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: RwLock::new(BrokerState::default()),
            round_robin: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` submissions with a broker send error.
    pub fn fail_next_submissions(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Total records accepted so far.
    pub fn total_delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// All records of a topic, partition by partition in offset order.
    pub async fn records(&self, topic: &str) -> Vec<DeliveredRecord> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of one partition in offset order.
    pub async fn partition_records(&self, topic: &str, partition: i32) -> Vec<DeliveredRecord> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Record counts of the non-empty partitions of a topic.
    pub async fn partition_counts(&self, topic: &str) -> HashMap<i32, usize> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        if let Some(partitions) = state.topics.get(topic) {
            for (partition, log) in partitions.iter().enumerate() {
                if !log.is_empty() {
                    counts.insert(partition as i32, log.len());
                }
            }
        }
        counts
    }

    fn place(&self, record: &BrokerRecord) -> std::result::Result<i32, String> {
        if let Some(partition) = record.partition {
            if partition < 0 || partition >= self.partitions {
                return Err(format!(
                    "partition {} is outside 0..{}",
                    partition, self.partitions
                ));
            }
            return Ok(partition);
        }
        if let Some(key) = &record.key {
            let mut hasher = DefaultHasher::new();
            hasher.write(key);
            return Ok((hasher.finish() % self.partitions as u64) as i32);
        }
        let next = self.round_robin.fetch_add(1, Ordering::SeqCst);
        Ok((next % self.partitions as usize) as i32)
    }
}

#[async_trait]
impl BrokerProducer for MemoryBroker {
    async fn submit(&self, record: BrokerRecord) -> Result<DeliveryHandle> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Ok(DeliveryHandle::resolved(Err(OutboxError::broker_send(
                "injected broker failure",
            ))));
        }

        let partition = match self.place(&record) {
            Ok(partition) => partition,
            Err(reason) => {
                return Ok(DeliveryHandle::resolved(Err(OutboxError::broker_send(
                    reason,
                ))))
            }
        };

        let mut state = self.state.write().await;
        let logs = state
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let log = &mut logs[partition as usize];
        let offset = log.len() as i64;
        log.push(DeliveredRecord {
            record,
            partition,
            offset,
        });
        drop(state);

        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(DeliveryHandle::resolved(Ok(RecordAck { partition, offset })))
    }
}
