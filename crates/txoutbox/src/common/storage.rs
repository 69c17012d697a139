//! Storage seam: outbox tables and the transactions that feed them
//!
//! The register path writes rows through [`OutboxTransaction`] so inserts
//! commit or roll back together with the caller's business writes. The
//! relay reads and deletes rows through [`OutboxStorage`] on its own
//! connections. [`MemoryStorage`] implements both sides in process and
//! backs the integration tests; the `postgres` and `mysql` features add
//! real database backends.

use crate::common::config::RelayConfig;
use crate::common::error::{OutboxError, Result};
use crate::common::metrics::MetricsTemplate;
use crate::common::types::{ShardPartition, StoredRow};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of inserting one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    /// Database-generated row id
    pub storage_id: i64,
    /// Lane the backend placed the row in
    pub partition: u32,
}

/// One open database transaction on the caller's side.
///
/// Implementations wrap a live driver transaction; the insert becomes
/// visible to the relay only when the caller commits.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// True while the transaction can still accept inserts.
    fn is_active(&self) -> bool;

    /// Insert one encoded blob into the shard's table, targeting the given
    /// partition. Backends that derive lanes from row ids report the
    /// actual lane in the result.
    async fn insert(&mut self, shard: u32, partition: u32, message: &[u8]) -> Result<InsertResult>;
}

/// Relay-side access to the outbox tables.
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Return up to `limit` committed rows of the lane with ids greater
    /// than `after_id`, in ascending id order.
    async fn poll_oldest(
        &self,
        shard_partition: ShardPartition,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>>;

    /// Delete the given rows. Missing ids are ignored.
    async fn delete_batch(&self, shard_partition: ShardPartition, ids: &[i64]) -> Result<()>;
}

/// Split a row count into descending delete chunks.
///
/// Keeping the chunk sizes to a fixed menu keeps `DELETE .. IN (..)`
/// statement shapes reusable by prepared-statement caches.
pub fn split_into_buckets(total: usize, sizes: &[usize]) -> Vec<usize> {
    let mut chunks = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let size = match sizes.iter().copied().find(|&s| s <= remaining) {
            Some(s) => s,
            None => remaining,
        };
        chunks.push(size);
        remaining -= size;
    }
    chunks
}

struct MemoryRow {
    partition: u32,
    message: Bytes,
}

#[derive(Default)]
struct MemoryTables {
    /// Committed rows per shard, ordered by id
    rows: HashMap<u32, BTreeMap<i64, MemoryRow>>,
}

/// In-memory storage backend.
///
/// Ids are assigned per shard at insert time from a shared counter, so
/// concurrent transactions observe the same interleavings a database
/// auto-increment column produces: ids may commit out of order and leave
/// gaps. Rows remember the lane they were registered for.
pub struct MemoryStorage {
    config: Arc<RelayConfig>,
    tables: Arc<RwLock<MemoryTables>>,
    next_ids: Arc<Vec<AtomicI64>>,
    metrics: MetricsTemplate,
}

impl MemoryStorage {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        let next_ids = (0..config.shards_count).map(|_| AtomicI64::new(1)).collect();
        Self {
            config,
            tables: Arc::new(RwLock::new(MemoryTables::default())),
            next_ids: Arc::new(next_ids),
            metrics: MetricsTemplate,
        }
    }

    /// Open a transaction. Inserts are staged and become visible to
    /// [`OutboxStorage::poll_oldest`] only on commit.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            config: Arc::clone(&self.config),
            tables: Arc::clone(&self.tables),
            next_ids: Arc::clone(&self.next_ids),
            staged: Vec::new(),
            state: TxnState::Active,
        }
    }

    /// Number of committed rows in a shard.
    pub async fn row_count(&self, shard: u32) -> usize {
        let tables = self.tables.read().await;
        tables.rows.get(&shard).map_or(0, |rows| rows.len())
    }

    /// Number of committed rows across all shards.
    pub async fn total_rows(&self) -> usize {
        let tables = self.tables.read().await;
        tables.rows.values().map(|rows| rows.len()).sum()
    }

    /// Whether a committed row with this id exists in the shard.
    pub async fn contains(&self, shard: u32, id: i64) -> bool {
        let tables = self.tables.read().await;
        tables
            .rows
            .get(&shard)
            .is_some_and(|rows| rows.contains_key(&id))
    }
}

#[async_trait]
impl OutboxStorage for MemoryStorage {
    async fn poll_oldest(
        &self,
        shard_partition: ShardPartition,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        let started = Instant::now();
        let tables = self.tables.read().await;
        self.metrics
            .record_dao_poll_get_connection(shard_partition, started);

        let rows = match tables.rows.get(&shard_partition.shard) {
            Some(rows) => rows,
            None => {
                self.metrics
                    .record_dao_poll_all_results(shard_partition, 0, started);
                return Ok(Vec::new());
            }
        };

        let mut polled = Vec::new();
        for (&id, row) in rows.range((after_id + 1)..) {
            if row.partition != shard_partition.partition {
                continue;
            }
            if polled.is_empty() {
                self.metrics
                    .record_dao_poll_first_result(shard_partition, started);
            }
            polled.push(StoredRow {
                id,
                message: row.message.clone(),
            });
            if polled.len() == limit {
                break;
            }
        }

        self.metrics
            .record_dao_poll_all_results(shard_partition, polled.len(), started);
        Ok(polled)
    }

    async fn delete_batch(&self, shard_partition: ShardPartition, ids: &[i64]) -> Result<()> {
        let mut offset = 0;
        for size in split_into_buckets(ids.len(), &self.config.delete_batch_sizes) {
            let chunk = &ids[offset..offset + size];
            offset += size;

            let mut tables = self.tables.write().await;
            let removed = tables.rows.get_mut(&shard_partition.shard).map_or(0, |rows| {
                chunk.iter().filter(|&&id| rows.remove(&id).is_some()).count()
            });
            drop(tables);

            if removed < chunk.len() {
                // Rows already gone, e.g. deleted under a previous lease
                debug!(
                    lane = %shard_partition,
                    missing = chunk.len() - removed,
                    "some rows were already deleted"
                );
            }
            self.metrics
                .record_dao_messages_deletion(shard_partition, size);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

struct StagedRow {
    shard: u32,
    partition: u32,
    id: i64,
    message: Bytes,
}

/// A staged in-memory transaction from [`MemoryStorage::begin`].
///
/// Dropping an active transaction rolls it back.
pub struct MemoryTransaction {
    config: Arc<RelayConfig>,
    tables: Arc<RwLock<MemoryTables>>,
    next_ids: Arc<Vec<AtomicI64>>,
    staged: Vec<StagedRow>,
    state: TxnState,
}

impl MemoryTransaction {
    /// Publish all staged rows atomically.
    pub async fn commit(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        let mut tables = self.tables.write().await;
        for row in self.staged.drain(..) {
            tables.rows.entry(row.shard).or_default().insert(
                row.id,
                MemoryRow {
                    partition: row.partition,
                    message: row.message,
                },
            );
        }
        self.state = TxnState::Committed;
    }

    /// Discard all staged rows.
    pub fn rollback(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        self.staged.clear();
        self.state = TxnState::RolledBack;
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[async_trait]
impl OutboxTransaction for MemoryTransaction {
    fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    async fn insert(&mut self, shard: u32, partition: u32, message: &[u8]) -> Result<InsertResult> {
        let counter = self
            .next_ids
            .get(shard as usize)
            .ok_or_else(|| OutboxError::storage_fatal(format!("shard {} has no table", shard)))?;
        let id = counter.fetch_add(1, Ordering::SeqCst);
        let partition = partition % self.config.partitions_for(shard).max(1);
        self.staged.push(StagedRow {
            shard,
            partition,
            id,
            message: Bytes::copy_from_slice(message),
        });
        Ok(InsertResult {
            storage_id: id,
            partition,
        })
    }
}
