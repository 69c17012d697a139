//! Test harness for relay scenario tests
//!
//! Provides:
//! - Idempotent tracing setup writing through the test capture
//! - A polling `wait_for` helper for eventually-true conditions
//! - A relay configuration tuned for millisecond poll cycles
//! - `FlakyStorage`, a fault-injecting storage wrapper

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use txoutbox::common::{MemoryStorage, OutboxError};
use txoutbox::{OutboxStorage, RelayConfig, Result, ShardPartition, StoredRow};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("txoutbox=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Ceiling for every eventually-true condition in the scenario tests.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Poll `check` every few milliseconds until it holds, panicking with
/// `what` once the timeout lapses.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out after {:?} waiting for {}", timeout, what);
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Relay configuration with millisecond pacing so scenarios finish fast.
pub fn fast_config() -> RelayConfig {
    RelayConfig::default()
        .with_poll_interval(Duration::from_millis(1), Duration::from_millis(10))
        .with_error_backoff(Duration::from_millis(1), Duration::from_millis(20))
        .with_shutdown_grace_period(Duration::from_secs(5))
}

/// Storage wrapper that fails a budgeted number of delete batches.
///
/// Polls pass straight through, so the relay keeps seeing rows it has
/// already published. This reproduces a node that dies between broker
/// acknowledgement and row deletion.
pub struct FlakyStorage {
    inner: Arc<MemoryStorage>,
    failing_deletes: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            failing_deletes: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` delete batches with a retryable storage error.
    pub fn fail_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutboxStorage for FlakyStorage {
    async fn poll_oldest(
        &self,
        shard_partition: ShardPartition,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        self.inner.poll_oldest(shard_partition, after_id, limit).await
    }

    async fn delete_batch(&self, shard_partition: ShardPartition, ids: &[i64]) -> Result<()> {
        let should_fail = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(OutboxError::storage_retryable("injected delete failure"));
        }
        self.inner.delete_batch(shard_partition, ids).await
    }
}
