//! Register path: validate, encode and insert messages inside the
//! caller's transaction
//!
//! [`TransactionalMessageSender`] is the producer-facing entry point. It
//! never talks to the broker: registering a message only writes a row, and
//! delivery happens later from the relay workers. The row commits or rolls
//! back together with the caller's business writes, which is the whole
//! point of the outbox.

use crate::common::codec;
use crate::common::config::RelayConfig;
use crate::common::error::{OutboxError, Result};
use crate::common::listener::ListenerRegistry;
use crate::common::metrics::MetricsTemplate;
use crate::common::storage::OutboxTransaction;
use crate::common::types::{MessageRegisteredEvent, OutboxMessage, SendResult, ShardPartition};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Broker topic name length limit.
const MAX_TOPIC_LEN: usize = 249;

/// Registers messages for eventual delivery.
///
/// One instance serves any number of concurrent callers. Partition
/// selection is per message: an explicit partition wins, then a key hash,
/// then per-shard round-robin.
pub struct TransactionalMessageSender {
    config: Arc<RelayConfig>,
    listeners: Arc<ListenerRegistry>,
    round_robin: Vec<AtomicU32>,
    metrics: MetricsTemplate,
}

impl TransactionalMessageSender {
    pub fn new(config: Arc<RelayConfig>, listeners: Arc<ListenerRegistry>) -> Self {
        // Random seeds so restarts do not pile onto partition zero
        let round_robin = (0..config.shards_count)
            .map(|_| AtomicU32::new(rand::random::<u32>()))
            .collect();
        Self {
            config,
            listeners,
            round_robin,
            metrics: MetricsTemplate,
        }
    }

    /// Register one message inside the caller's open transaction.
    ///
    /// The encoded row is inserted through `txn` and becomes visible to the
    /// relay when the caller commits. Returns the lane and row id under
    /// which the message was stored.
    pub async fn send_message<T>(&self, txn: &mut T, message: OutboxMessage) -> Result<SendResult>
    where
        T: OutboxTransaction + ?Sized,
    {
        self.validate(&message)?;

        let shard = message.shard.unwrap_or(self.config.default_shard);
        let partitions = self.config.partitions_for(shard);
        let partition = self.select_partition(shard, &message, partitions);

        let encoded = codec::encode(&message, &self.config.compression)?;

        if !txn.is_active() {
            return Err(OutboxError::no_transaction(
                "message registration requires an open database transaction",
            ));
        }

        let insert = txn.insert(shard, partition, &encoded.blob).await?;
        let shard_partition = ShardPartition::new(shard, insert.partition);

        // Only rows that actually landed count towards the ratio
        if let Some(ratio) = encoded.compression_ratio() {
            self.metrics
                .record_compression_ratio(Some(shard_partition), encoded.algorithm, ratio);
        }
        self.metrics
            .record_dao_message_insert(shard_partition, &message.topic);
        self.metrics
            .record_message_registering(&message.topic, shard_partition);

        self.listeners.fire_message_registered(&MessageRegisteredEvent {
            shard_partition,
            storage_id: insert.storage_id,
            message,
        });

        Ok(SendResult {
            shard_partition,
            storage_id: insert.storage_id,
        })
    }

    fn validate(&self, message: &OutboxMessage) -> Result<()> {
        validate_topic(&message.topic)?;

        if message.value.len() > self.config.max_message_size {
            return Err(OutboxError::validation(format!(
                "message of {} bytes exceeds the {} byte limit",
                message.value.len(),
                self.config.max_message_size
            )));
        }
        if let Some(partition) = message.partition {
            if partition < 0 {
                return Err(OutboxError::validation(format!(
                    "partition {} is negative",
                    partition
                )));
            }
        }
        for header in &message.headers {
            if header.name.is_empty() {
                return Err(OutboxError::validation("header name is empty"));
            }
        }
        if let Some(shard) = message.shard {
            if shard >= self.config.shards_count {
                return Err(OutboxError::validation(format!(
                    "shard {} is out of range, {} shards are configured",
                    shard, self.config.shards_count
                )));
            }
        }
        Ok(())
    }

    fn select_partition(&self, shard: u32, message: &OutboxMessage, partitions: u32) -> u32 {
        if let Some(partition) = message.partition {
            return partition as u32 % partitions;
        }
        if let Some(key) = &message.key {
            let mut hasher = DefaultHasher::new();
            hasher.write(key);
            return (hasher.finish() % u64::from(partitions)) as u32;
        }
        self.round_robin[shard as usize].fetch_add(1, Ordering::Relaxed) % partitions
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(OutboxError::validation("topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(OutboxError::validation(format!(
            "topic of {} chars exceeds the {} char limit",
            topic.len(),
            MAX_TOPIC_LEN
        )));
    }
    if let Some(bad) = topic
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
    {
        return Err(OutboxError::validation(format!(
            "topic {:?} contains illegal character {:?}",
            topic, bad
        )));
    }
    Ok(())
}
