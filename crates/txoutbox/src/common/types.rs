//! Core message and addressing types shared across the crate.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

/// Addresses one outbox lane: the unit of ordering, leasing and polling.
///
/// Shards separate physical tables; partitions split a shard's traffic so
/// that several workers can drain it concurrently. Every message belongs to
/// exactly one lane once its row is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardPartition {
    /// Shard index, selects the physical table
    pub shard: u32,
    /// Partition index within the shard
    pub partition: u32,
}

impl ShardPartition {
    pub fn new(shard: u32, partition: u32) -> Self {
        Self { shard, partition }
    }

    /// Lock resource name used by the lease coordinator for this lane.
    pub fn lock_name(&self) -> String {
        format!("/tw/tkms/shard/{}/partition/{}", self.shard, self.partition)
    }

    /// Shard index as a metric label value.
    pub fn shard_label(&self) -> String {
        self.shard.to_string()
    }

    /// Partition index as a metric label value.
    pub fn partition_label(&self) -> String {
        self.partition.to_string()
    }
}

impl fmt::Display for ShardPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shard, self.partition)
    }
}

/// A single header forwarded to the broker verbatim.
///
/// Header order is preserved from registration through delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub value: Bytes,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A message handed to the outbox for eventual delivery.
///
/// Only `topic` and `value` are required. Key and explicit partition steer
/// broker placement; the shard override steers which outbox table the row
/// lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Destination topic
    pub topic: String,
    /// Optional partitioning key
    pub key: Option<Bytes>,
    /// Optional explicit broker partition
    pub partition: Option<i32>,
    /// Optional producer-set timestamp
    pub timestamp: Option<DateTime<Utc>>,
    /// Headers, forwarded in order
    pub headers: Vec<MessageHeader>,
    /// Message payload
    pub value: Bytes,
    /// Optional shard override; defaults to the configured default shard
    pub shard: Option<u32>,
}

impl OutboxMessage {
    /// Create a message with the required fields.
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            partition: None,
            timestamp: None,
            headers: Vec::new(),
            value: value.into(),
            shard: None,
        }
    }

    /// Set the partitioning key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set an explicit broker partition.
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the producer timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Route the message to a specific shard.
    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Append a header.
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(MessageHeader::new(name, value));
        self
    }
}

/// One polled outbox row: the generated id plus the encoded blob.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: i64,
    pub message: Bytes,
}

/// Returned from a successful registration.
///
/// The id together with the lane uniquely identifies the stored row until
/// the relay deletes it after broker acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    /// Lane the row was placed in
    pub shard_partition: ShardPartition,
    /// Database-generated row id
    pub storage_id: i64,
}

/// Fired synchronously on the registering task after a row is inserted.
#[derive(Debug, Clone)]
pub struct MessageRegisteredEvent {
    pub shard_partition: ShardPartition,
    pub storage_id: i64,
    pub message: OutboxMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_partition_lock_name() {
        let sp = ShardPartition::new(2, 7);
        assert_eq!(sp.lock_name(), "/tw/tkms/shard/2/partition/7");
        assert_eq!(sp.to_string(), "2:7");
        assert_eq!(sp.shard_label(), "2");
        assert_eq!(sp.partition_label(), "7");
    }

    #[test]
    fn test_shard_partition_ordering() {
        let a = ShardPartition::new(0, 1);
        let b = ShardPartition::new(1, 0);
        assert!(a < b);
        assert_eq!(a, ShardPartition::new(0, 1));
    }

    #[test]
    fn test_message_builder() {
        let msg = OutboxMessage::new("orders", "payload")
            .with_key("order-1")
            .with_partition(3)
            .with_shard(1)
            .add_header("trace-id", "abc")
            .add_header("source", "billing");

        assert_eq!(msg.topic, "orders");
        assert_eq!(msg.key, Some(Bytes::from("order-1")));
        assert_eq!(msg.partition, Some(3));
        assert_eq!(msg.shard, Some(1));
        assert_eq!(msg.headers.len(), 2);
        assert_eq!(msg.headers[0].name, "trace-id");
        assert_eq!(msg.headers[0].value, Bytes::from("abc"));
        assert_eq!(msg.headers[1].name, "source");
    }

    #[test]
    fn test_message_defaults() {
        let msg = OutboxMessage::new("t", "v");
        assert!(msg.key.is_none());
        assert!(msg.partition.is_none());
        assert!(msg.timestamp.is_none());
        assert!(msg.shard.is_none());
        assert!(msg.headers.is_empty());
    }
}
