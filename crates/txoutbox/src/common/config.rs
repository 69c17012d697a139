//! Relay and storage configuration
//!
//! Defaults match a single-node deployment: one shard, one partition,
//! snappy compression, 30 second leases. Multi-node deployments raise
//! the partition count and plug in a shared lease coordinator.

use crate::common::compression::CompressionAlgorithm;
use crate::common::error::{OutboxError, Result};
use crate::common::types::ShardPartition;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// How the storage layer derives SQL for a shard table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseDialect {
    /// Generated-keys inserts, MySQL-style
    #[default]
    Generic,
    /// `INSERT .. RETURNING id`, PostgreSQL-style
    AppendOptimized,
}

/// Compression settings for stored blobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm applied to payloads at or above `min_size`
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this are stored uncompressed
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Snappy,
            min_size: 128,
        }
    }
}

/// Configuration for the outbox relay and register path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Number of shards (physical tables)
    pub shards_count: u32,
    /// Partitions per shard, unless overridden per shard
    pub partitions_count: u32,
    /// Per-shard partition count overrides
    pub partitions_count_overrides: HashMap<u32, u32>,
    /// Shard used when a message carries no shard override
    pub default_shard: u32,
    /// Maximum rows fetched per poll
    pub poll_batch_size: usize,
    /// Descending delete chunk sizes; statement shapes stay cacheable
    pub delete_batch_sizes: Vec<usize>,
    /// Poll interval floor after a productive cycle
    pub min_poll_interval: Duration,
    /// Poll interval ceiling while the lane is idle
    pub max_poll_interval: Duration,
    /// First backoff after an error
    pub min_error_backoff: Duration,
    /// Backoff ceiling for repeated errors
    pub max_error_backoff: Duration,
    /// Blob compression settings
    pub compression: CompressionConfig,
    /// Maximum accepted payload size in bytes
    pub max_message_size: usize,
    /// How long shutdown waits for workers to drain
    pub shutdown_grace_period: Duration,
    /// SQL flavor for the storage layer; backend constructors verify it
    /// matches the dialect they implement
    pub database_dialect: DatabaseDialect,
    /// Lease duration for lane ownership
    pub lease_ttl: Duration,
    /// Timeout for one poll query
    pub poll_query_timeout: Duration,
    /// Timeout for one broker acknowledgement
    pub send_timeout: Duration,
    /// Timeout for one delete batch
    pub delete_timeout: Duration,
    /// Base name for outbox tables; shard index is appended
    pub table_base_name: String,
    /// Tolerated backwards skew for generated-id sanity checks
    pub insert_id_skew: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shards_count: 1,
            partitions_count: 1,
            partitions_count_overrides: HashMap::new(),
            default_shard: 0,
            poll_batch_size: 1024,
            delete_batch_sizes: vec![256, 100, 50, 25, 10, 5, 2, 1],
            min_poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_secs(1),
            min_error_backoff: Duration::from_millis(100),
            max_error_backoff: Duration::from_secs(30),
            compression: CompressionConfig::default(),
            max_message_size: 10 * 1024 * 1024,
            shutdown_grace_period: Duration::from_secs(25),
            database_dialect: DatabaseDialect::default(),
            lease_ttl: Duration::from_secs(30),
            poll_query_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            delete_timeout: Duration::from_secs(10),
            table_base_name: "outgoing_message".to_string(),
            insert_id_skew: 100_000,
        }
    }
}

impl RelayConfig {
    pub fn with_shards_count(mut self, shards: u32) -> Self {
        self.shards_count = shards;
        self
    }

    pub fn with_partitions_count(mut self, partitions: u32) -> Self {
        self.partitions_count = partitions;
        self
    }

    pub fn with_partitions_count_override(mut self, shard: u32, partitions: u32) -> Self {
        self.partitions_count_overrides.insert(shard, partitions);
        self
    }

    pub fn with_default_shard(mut self, shard: u32) -> Self {
        self.default_shard = shard;
        self
    }

    pub fn with_poll_batch_size(mut self, size: usize) -> Self {
        self.poll_batch_size = size;
        self
    }

    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.max_poll_interval = max;
        self
    }

    pub fn with_error_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_error_backoff = min;
        self.max_error_backoff = max;
        self
    }

    pub fn with_compression(mut self, algorithm: CompressionAlgorithm, min_size: usize) -> Self {
        self.compression = CompressionConfig {
            algorithm,
            min_size,
        };
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    pub fn with_database_dialect(mut self, dialect: DatabaseDialect) -> Self {
        self.database_dialect = dialect;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_table_base_name(mut self, name: impl Into<String>) -> Self {
        self.table_base_name = name.into();
        self
    }

    /// Partition count effective for a shard.
    pub fn partitions_for(&self, shard: u32) -> u32 {
        self.partitions_count_overrides
            .get(&shard)
            .copied()
            .unwrap_or(self.partitions_count)
    }

    /// Enumerate every lane this configuration defines.
    pub fn shard_partitions(&self) -> Vec<ShardPartition> {
        let mut lanes = Vec::new();
        for shard in 0..self.shards_count {
            for partition in 0..self.partitions_for(shard) {
                lanes.push(ShardPartition::new(shard, partition));
            }
        }
        lanes
    }

    /// Table name for a shard.
    pub fn table_name(&self, shard: u32) -> String {
        format!("{}_{}", self.table_base_name, shard)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.shards_count == 0 {
            return Err(OutboxError::config("shards_count must be at least 1"));
        }
        if self.partitions_count == 0 {
            return Err(OutboxError::config("partitions_count must be at least 1"));
        }
        for (&shard, &partitions) in &self.partitions_count_overrides {
            if shard >= self.shards_count {
                return Err(OutboxError::config(format!(
                    "partition override references unknown shard {}",
                    shard
                )));
            }
            if partitions == 0 {
                return Err(OutboxError::config(format!(
                    "partition override for shard {} must be at least 1",
                    shard
                )));
            }
        }
        if self.default_shard >= self.shards_count {
            return Err(OutboxError::config(format!(
                "default_shard {} is outside 0..{}",
                self.default_shard, self.shards_count
            )));
        }
        if self.poll_batch_size == 0 {
            return Err(OutboxError::config("poll_batch_size must be at least 1"));
        }
        if self.delete_batch_sizes.is_empty() {
            return Err(OutboxError::config("delete_batch_sizes must not be empty"));
        }
        if self.delete_batch_sizes.last() != Some(&1) {
            return Err(OutboxError::config(
                "delete_batch_sizes must end with 1 so any remainder can drain",
            ));
        }
        if self.delete_batch_sizes.windows(2).any(|w| w[0] <= w[1]) {
            return Err(OutboxError::config(
                "delete_batch_sizes must be strictly descending",
            ));
        }
        if self.min_poll_interval > self.max_poll_interval {
            return Err(OutboxError::config(
                "min_poll_interval must not exceed max_poll_interval",
            ));
        }
        if self.min_error_backoff > self.max_error_backoff {
            return Err(OutboxError::config(
                "min_error_backoff must not exceed max_error_backoff",
            ));
        }
        if self.max_message_size == 0 {
            return Err(OutboxError::config("max_message_size must be at least 1"));
        }
        if self.lease_ttl.is_zero() {
            return Err(OutboxError::config("lease_ttl must be positive"));
        }
        if self.insert_id_skew < 0 {
            return Err(OutboxError::config("insert_id_skew must not be negative"));
        }
        if self.table_base_name.is_empty() {
            return Err(OutboxError::config("table_base_name must not be empty"));
        }
        // Table names are interpolated into SQL; keep them to identifier
        // characters.
        if !self
            .table_base_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || self
                .table_base_name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        {
            return Err(OutboxError::config(format!(
                "table_base_name '{}' is not a plain SQL identifier",
                self.table_base_name
            )));
        }
        Ok(())
    }
}
