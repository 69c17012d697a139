//! Relay supervisor and public assembly point
//!
//! [`OutboxRelay`] owns one supervisor task per (shard,partition) lane.
//! Each supervisor runs the lane's worker inside its own task and restarts
//! it with backoff if it ever panics; the supervisor itself only exits on
//! shutdown. [`RelayBuilder`] wires the collaborators together and applies
//! defaults for the optional ones.

use crate::common::broker::BrokerProducer;
use crate::common::config::RelayConfig;
use crate::common::error::{OutboxError, Result};
use crate::common::interceptor::{InterceptorChain, MessageInterceptor};
use crate::common::lease::{LeaseCoordinator, MemoryLeaseCoordinator};
use crate::common::listener::{EventsListener, ListenerRegistry};
use crate::common::metrics::MetricsTemplate;
use crate::common::producer::TransactionalMessageSender;
use crate::common::storage::OutboxStorage;
use crate::common::types::ShardPartition;
use crate::common::worker::PartitionWorker;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Relay counters, updated by the workers.
#[derive(Debug, Default)]
pub struct RelayStats {
    polls: AtomicU64,
    empty_polls: AtomicU64,
    cycles: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    messages_deleted: AtomicU64,
    messages_discarded: AtomicU64,
    decode_failures: AtomicU64,
    lease_losses: AtomicU64,
    worker_restarts: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_poll(&self, rows: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if rows == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_success(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self, rows: u64) {
        self.messages_deleted.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, rows: u64) {
        self.messages_discarded.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lease_loss(&self) {
        self.lease_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            messages_deleted: self.messages_deleted.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            lease_losses: self.lease_losses.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`RelayStats`].
#[derive(Debug, Clone)]
pub struct RelayStatsSnapshot {
    pub polls: u64,
    pub empty_polls: u64,
    pub cycles: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub messages_deleted: u64,
    pub messages_discarded: u64,
    pub decode_failures: u64,
    pub lease_losses: u64,
    pub worker_restarts: u64,
}

/// Builder for [`OutboxRelay`].
///
/// Storage and broker are required; everything else has a default. The
/// default lease coordinator is in-process, which is only safe when one
/// process owns the outbox tables.
#[derive(Default)]
pub struct RelayBuilder {
    config: RelayConfig,
    storage: Option<Arc<dyn OutboxStorage>>,
    broker: Option<Arc<dyn BrokerProducer>>,
    lease: Option<Arc<dyn LeaseCoordinator>>,
    interceptors: InterceptorChain,
    listeners: Vec<Arc<dyn EventsListener>>,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn OutboxStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn BrokerProducer>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn lease_coordinator(mut self, lease: Arc<dyn LeaseCoordinator>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.add(interceptor);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventsListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<OutboxRelay> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| OutboxError::config("a storage backend is required"))?;
        let broker = self
            .broker
            .ok_or_else(|| OutboxError::config("a broker producer is required"))?;
        let lease = self
            .lease
            .unwrap_or_else(|| Arc::new(MemoryLeaseCoordinator::new()));

        let config = Arc::new(self.config);
        let listeners = Arc::new(ListenerRegistry::new());
        for listener in self.listeners {
            listeners.register(listener);
        }
        let sender = Arc::new(TransactionalMessageSender::new(
            Arc::clone(&config),
            Arc::clone(&listeners),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(OutboxRelay {
            config,
            storage,
            broker,
            lease,
            interceptors: Arc::new(self.interceptors),
            listeners,
            sender,
            stats: Arc::new(RelayStats::new()),
            metrics: MetricsTemplate,
            shutdown_tx,
            supervisors: Mutex::new(Vec::new()),
        })
    }
}

/// The running relay: registers messages on one side, delivers them on the
/// other.
pub struct OutboxRelay {
    config: Arc<RelayConfig>,
    storage: Arc<dyn OutboxStorage>,
    broker: Arc<dyn BrokerProducer>,
    lease: Arc<dyn LeaseCoordinator>,
    interceptors: Arc<InterceptorChain>,
    listeners: Arc<ListenerRegistry>,
    sender: Arc<TransactionalMessageSender>,
    stats: Arc<RelayStats>,
    metrics: MetricsTemplate,
    shutdown_tx: watch::Sender<bool>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutboxRelay {
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    /// Spawn one supervisor per lane. Calling start on a relay that is
    /// already running does nothing; a relay that was shut down stays down.
    pub async fn start(&self) -> Result<()> {
        let mut supervisors = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !supervisors.is_empty() {
            return Ok(());
        }
        if *self.shutdown_tx.borrow() {
            return Err(OutboxError::config("relay was already shut down"));
        }

        self.metrics.register_library();
        let lanes = self.config.shard_partitions();
        info!(
            shards = self.config.shards_count,
            lanes = lanes.len(),
            "outbox relay starting"
        );
        for sp in lanes {
            supervisors.push(self.spawn_supervisor(sp));
        }
        Ok(())
    }

    /// Signal all workers and wait up to the shutdown grace period for them
    /// to drain. Stragglers are abandoned; their leases lapse by TTL.
    pub async fn shutdown(&self) -> Result<()> {
        info!("outbox relay shutting down");
        let _ = self.shutdown_tx.send(true);

        let supervisors = {
            let mut guard = self
                .supervisors
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            mem::take(&mut *guard)
        };

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace_period;
        for mut handle in supervisors {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("worker did not stop within the grace period, aborting");
                    handle.abort();
                }
            }
        }
        info!("outbox relay stopped");
        Ok(())
    }

    /// The register-path entry point bound to this relay's configuration
    /// and listeners.
    pub fn sender(&self) -> Arc<TransactionalMessageSender> {
        Arc::clone(&self.sender)
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Add a registration listener after construction.
    pub fn register_listener(&self, listener: Arc<dyn EventsListener>) {
        self.listeners.register(listener);
    }

    /// Remove a registration listener, matched by identity.
    pub fn unregister_listener(&self, listener: &Arc<dyn EventsListener>) {
        self.listeners.unregister(listener);
    }

    fn spawn_supervisor(&self, sp: ShardPartition) -> JoinHandle<()> {
        let config = Arc::clone(&self.config);
        let storage = Arc::clone(&self.storage);
        let broker = Arc::clone(&self.broker);
        let lease = Arc::clone(&self.lease);
        let interceptors = Arc::clone(&self.interceptors);
        let stats = Arc::clone(&self.stats);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut backoff = config.min_error_backoff;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let worker = PartitionWorker::new(
                    sp,
                    Arc::clone(&config),
                    Arc::clone(&storage),
                    Arc::clone(&broker),
                    Arc::clone(&lease),
                    Arc::clone(&interceptors),
                    Arc::clone(&stats),
                    shutdown.clone(),
                );
                match tokio::spawn(worker.run()).await {
                    // The worker only returns on shutdown
                    Ok(()) => break,
                    Err(err) => {
                        stats.record_worker_restart();
                        error!(lane = %sp, error = %err, "worker crashed, restarting");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                        backoff = (backoff * 2).min(config.max_error_backoff);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::broker::MemoryBroker;
    use crate::common::error::Result;
    use crate::common::storage::{MemoryStorage, OutboxStorage};
    use crate::common::types::{OutboxMessage, ShardPartition, StoredRow};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fast_config() -> RelayConfig {
        RelayConfig::default()
            .with_poll_interval(Duration::from_millis(1), Duration::from_millis(10))
            .with_error_backoff(Duration::from_millis(1), Duration::from_millis(10))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2.5s");
    }

    #[test]
    fn test_builder_requires_storage_and_broker() {
        let err = OutboxRelay::builder().build().unwrap_err();
        assert_eq!(err.error_code(), "config");

        let storage = Arc::new(MemoryStorage::new(Arc::new(RelayConfig::default())));
        let err = OutboxRelay::builder()
            .storage(storage)
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "config");
    }

    #[test]
    fn test_builder_validates_config() {
        let storage = Arc::new(MemoryStorage::new(Arc::new(RelayConfig::default())));
        let err = OutboxRelay::builder()
            .config(RelayConfig::default().with_partitions_count(0))
            .storage(storage)
            .broker(Arc::new(MemoryBroker::new(1)))
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "config");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_round_trip() {
        let config = fast_config();
        let storage = Arc::new(MemoryStorage::new(Arc::new(config.clone())));
        let broker = Arc::new(MemoryBroker::new(4));
        let relay = OutboxRelay::builder()
            .config(config)
            .storage(Arc::clone(&storage) as Arc<dyn OutboxStorage>)
            .broker(Arc::clone(&broker) as _)
            .build()
            .unwrap();
        relay.start().await.unwrap();

        let sender = relay.sender();
        let mut txn = storage.begin();
        for i in 0..3 {
            sender
                .send_message(&mut txn, OutboxMessage::new("orders", format!("m{}", i)))
                .await
                .unwrap();
        }
        txn.commit().await;

        let probe = Arc::clone(&broker);
        wait_until(move || probe.total_delivered() == 3).await;

        // Deletes follow the acks shortly
        let mut drained = false;
        for _ in 0..500 {
            if storage.total_rows().await == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(drained, "outbox table never drained");

        relay.shutdown().await.unwrap();
        let stats = relay.stats();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_deleted, 3);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_is_final() {
        let config = fast_config();
        let storage = Arc::new(MemoryStorage::new(Arc::new(config.clone())));
        let relay = OutboxRelay::builder()
            .config(config)
            .storage(storage as Arc<dyn OutboxStorage>)
            .broker(Arc::new(MemoryBroker::new(1)))
            .build()
            .unwrap();

        relay.start().await.unwrap();
        relay.start().await.unwrap();
        relay.shutdown().await.unwrap();
        relay.shutdown().await.unwrap();

        let err = relay.start().await.unwrap_err();
        assert_eq!(err.error_code(), "config");
    }

    struct PanickyStorage {
        inner: Arc<MemoryStorage>,
        panics_left: AtomicUsize,
    }

    #[async_trait]
    impl OutboxStorage for PanickyStorage {
        async fn poll_oldest(
            &self,
            shard_partition: ShardPartition,
            after_id: i64,
            limit: usize,
        ) -> Result<Vec<StoredRow>> {
            let should_panic = self
                .panics_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_panic {
                panic!("injected poll panic");
            }
            self.inner.poll_oldest(shard_partition, after_id, limit).await
        }

        async fn delete_batch(&self, shard_partition: ShardPartition, ids: &[i64]) -> Result<()> {
            self.inner.delete_batch(shard_partition, ids).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_supervisor_restarts_crashed_worker() {
        let config = fast_config();
        let inner = Arc::new(MemoryStorage::new(Arc::new(config.clone())));
        let storage = Arc::new(PanickyStorage {
            inner: Arc::clone(&inner),
            panics_left: AtomicUsize::new(2),
        });
        let broker = Arc::new(MemoryBroker::new(1));
        let relay = OutboxRelay::builder()
            .config(config)
            .storage(storage as Arc<dyn OutboxStorage>)
            .broker(Arc::clone(&broker) as _)
            .build()
            .unwrap();
        relay.start().await.unwrap();

        let sender = relay.sender();
        let mut txn = inner.begin();
        sender
            .send_message(&mut txn, OutboxMessage::new("orders", "survives"))
            .await
            .unwrap();
        txn.commit().await;

        let probe = Arc::clone(&broker);
        wait_until(move || probe.total_delivered() == 1).await;

        relay.shutdown().await.unwrap();
        let stats = relay.stats();
        assert!(stats.worker_restarts >= 1);
        assert_eq!(stats.messages_sent, 1);
    }
}
