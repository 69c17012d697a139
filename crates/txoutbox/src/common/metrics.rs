//! Metrics template
//!
//! Every measurement the library emits goes through here, against the
//! `metrics` facade. Names and labels are a stable contract: dashboards
//! and alerts are built on them, so changing one is a breaking change.

use crate::common::compression::CompressionAlgorithm;
use crate::common::types::ShardPartition;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

pub const LIBRARY_INFO: &str = "tw.library.info";

pub const PROXY_POLL: &str = "tw.tkms.proxy.poll";
pub const PROXY_CYCLE: &str = "tw.tkms.proxy.cycle";
pub const PROXY_MESSAGE_SEND: &str = "tw.tkms.proxy.message.send";
pub const PROXY_KAFKA_MESSAGES_SEND: &str = "tw.tkms.proxy.kafka.messages.send";
pub const PROXY_MESSAGES_DELETE: &str = "tw.tkms.proxy.messages.delete";
pub const PROXY_OLDEST_MESSAGE_AGE: &str = "tw.tkms.proxy.oldest.message.age";

pub const INTERFACE_MESSAGE_REGISTRATION: &str = "tw.tkms.interface.message.registration";

pub const DAO_MESSAGE_INSERT: &str = "tw.tkms.dao.message.insert";
pub const DAO_MESSAGES_DELETE: &str = "tw.tkms.dao.messages.delete";
pub const DAO_POLL_FIRST_RESULT: &str = "tw.tkms.dao.poll.first.result";
pub const DAO_POLL_ALL_RESULTS: &str = "tw.tkms.dao.poll.all.results";
pub const DAO_POLL_ALL_RESULTS_COUNT: &str = "tw.tkms.dao.poll.all.results.count";
pub const DAO_POLL_GET_CONNECTION: &str = "tw.tkms.dao.poll.get.connection";
pub const DAO_INVALID_GENERATED_KEYS: &str = "tw.tkms.dao.insert.invalid.generated.keys.count";

pub const STORED_MESSAGE_PARSING: &str = "tw.tkms.stored.message.parsing";
pub const MESSAGE_INSERT_TO_ACK: &str = "tw.tkms.message.insert.to.ack";
pub const COMPRESSION_RATIO_ACHIEVED: &str = "tw.tkms.compression.ratio.achieved";

const TAG_NA: &str = "N/A";

/// Emits the library's metrics with stable names and labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsTemplate;

impl MetricsTemplate {
    /// Publish a one-time info gauge carrying the library version.
    pub fn register_library(&self) {
        gauge!(
            LIBRARY_INFO,
            "version" => env!("CARGO_PKG_VERSION"),
            "library" => "txoutbox"
        )
        .set(1.0);
    }

    pub fn record_proxy_poll(&self, sp: ShardPartition, records: usize, started: Instant) {
        histogram!(
            PROXY_POLL,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "pollResult" => poll_result(records)
        )
        .record(started.elapsed().as_secs_f64());
    }

    pub fn record_proxy_cycle(&self, sp: ShardPartition, records: usize, started: Instant) {
        histogram!(
            PROXY_CYCLE,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "pollResult" => poll_result(records)
        )
        .record(started.elapsed().as_secs_f64());
    }

    pub fn record_message_send(&self, sp: ShardPartition, topic: &str, success: bool) {
        counter!(
            PROXY_MESSAGE_SEND,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "topic" => topic.to_string(),
            "success" => if success { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Time from row registration to broker acknowledgement.
    pub fn record_insert_to_ack(
        &self,
        sp: ShardPartition,
        topic: &str,
        insert_time: DateTime<Utc>,
    ) {
        let elapsed_ms = (Utc::now() - insert_time).num_milliseconds().max(0);
        histogram!(
            MESSAGE_INSERT_TO_ACK,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "topic" => topic.to_string()
        )
        .record(elapsed_ms as f64 / 1000.0);
    }

    pub fn record_broker_messages_send(&self, sp: ShardPartition, started: Instant) {
        histogram!(
            PROXY_KAFKA_MESSAGES_SEND,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(started.elapsed().as_secs_f64());
    }

    pub fn record_proxy_messages_deletion(&self, sp: ShardPartition, started: Instant) {
        histogram!(
            PROXY_MESSAGES_DELETE,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(started.elapsed().as_secs_f64());
    }

    /// Age of the oldest undelivered message in a lane. Zero when the
    /// lane is empty.
    pub fn record_oldest_message_age(&self, sp: ShardPartition, age: Duration) {
        gauge!(
            PROXY_OLDEST_MESSAGE_AGE,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .set(age.as_secs_f64());
    }

    pub fn record_message_registering(&self, topic: &str, sp: ShardPartition) {
        counter!(
            INTERFACE_MESSAGE_REGISTRATION,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn record_dao_message_insert(&self, sp: ShardPartition, topic: &str) {
        counter!(
            DAO_MESSAGE_INSERT,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn record_dao_messages_deletion(&self, sp: ShardPartition, batch_size: usize) {
        counter!(
            DAO_MESSAGES_DELETE,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label(),
            "batchSize" => batch_size.to_string()
        )
        .increment(1);
    }

    pub fn record_dao_poll_first_result(&self, sp: ShardPartition, started: Instant) {
        histogram!(
            DAO_POLL_FIRST_RESULT,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(started.elapsed().as_secs_f64());
    }

    pub fn record_dao_poll_all_results(&self, sp: ShardPartition, records: usize, started: Instant) {
        histogram!(
            DAO_POLL_ALL_RESULTS,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(started.elapsed().as_secs_f64());
        histogram!(
            DAO_POLL_ALL_RESULTS_COUNT,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(records as f64);
    }

    pub fn record_dao_poll_get_connection(&self, sp: ShardPartition, started: Instant) {
        histogram!(
            DAO_POLL_GET_CONNECTION,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(started.elapsed().as_secs_f64());
    }

    /// A generated key failed the monotonicity sanity check.
    pub fn record_dao_invalid_generated_keys(&self, sp: ShardPartition) {
        counter!(
            DAO_INVALID_GENERATED_KEYS,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .increment(1);
    }

    pub fn record_stored_message_parsing(&self, sp: ShardPartition, started: Instant) {
        histogram!(
            STORED_MESSAGE_PARSING,
            "shard" => sp.shard_label(),
            "partition" => sp.partition_label()
        )
        .record(started.elapsed().as_secs_f64());
    }

    /// Ratio of compressed to uncompressed payload size. Labels fall back
    /// to `N/A` when the emitting side does not know the lane.
    pub fn record_compression_ratio(
        &self,
        sp: Option<ShardPartition>,
        algorithm: CompressionAlgorithm,
        ratio: f64,
    ) {
        let (shard, partition) = match sp {
            Some(sp) => (sp.shard_label(), sp.partition_label()),
            None => (TAG_NA.to_string(), TAG_NA.to_string()),
        };
        histogram!(
            COMPRESSION_RATIO_ACHIEVED,
            "shard" => shard,
            "partition" => partition,
            "algorithm" => algorithm.as_str()
        )
        .record(ratio);
    }
}

fn poll_result(records: usize) -> &'static str {
    if records == 0 {
        "empty"
    } else {
        "not_empty"
    }
}
