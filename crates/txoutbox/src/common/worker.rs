//! Per-lane relay worker
//!
//! One worker owns one (shard,partition) lane. It runs a state machine of
//! `Idle → Leasing → Running → Draining → Stopped`: acquire the lane lease,
//! then cycle poll → decode → intercept → submit → await acks in row order
//! → delete the resolved rows. Every await races the shutdown signal so the
//! worker stays responsive inside the shutdown grace period.
//!
//! Rows leave the table only after the broker acknowledged them or an
//! interceptor discarded them, so delivery is at-least-once. Acks are
//! awaited in ascending id order and a failure aborts the rest of the
//! batch, which keeps publication FIFO per lane.

use crate::common::broker::{BrokerProducer, BrokerRecord, DeliveryHandle};
use crate::common::codec;
use crate::common::config::RelayConfig;
use crate::common::error::{OutboxError, Result};
use crate::common::interceptor::{InterceptorChain, ProxyDecision};
use crate::common::lease::{LeaseCoordinator, LeaseToken};
use crate::common::metrics::MetricsTemplate;
use crate::common::pacemaker::PaceMaker;
use crate::common::relay::RelayStats;
use crate::common::storage::OutboxStorage;
use crate::common::types::{ShardPartition, StoredRow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Leasing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    /// Not resolved in this cycle; stays in the table
    Pending,
    /// Broker acknowledged the record
    Acked,
    /// An interceptor dropped the row; deleted without sending
    Discarded,
}

/// What one relay cycle did, for pacing decisions.
struct CycleOutcome {
    polled: usize,
    /// An interceptor vetoed the tail of the batch for a later retry
    retry_requested: bool,
}

/// One polled row moving through a relay cycle.
struct ProxiedRow {
    id: i64,
    record: BrokerRecord,
    insert_time: Option<DateTime<Utc>>,
    handle: Option<DeliveryHandle>,
    outcome: RowOutcome,
}

pub(crate) struct PartitionWorker {
    sp: ShardPartition,
    config: Arc<RelayConfig>,
    storage: Arc<dyn OutboxStorage>,
    broker: Arc<dyn BrokerProducer>,
    lease: Arc<dyn LeaseCoordinator>,
    interceptors: Arc<InterceptorChain>,
    stats: Arc<RelayStats>,
    metrics: MetricsTemplate,
    shutdown: watch::Receiver<bool>,
    pace: PaceMaker,
    /// Rows at or below this id are resolved or retried from scratch;
    /// polls only look above it
    cursor: i64,
    token: Option<LeaseToken>,
    last_refresh: Instant,
}

impl PartitionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sp: ShardPartition,
        config: Arc<RelayConfig>,
        storage: Arc<dyn OutboxStorage>,
        broker: Arc<dyn BrokerProducer>,
        lease: Arc<dyn LeaseCoordinator>,
        interceptors: Arc<InterceptorChain>,
        stats: Arc<RelayStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pace = PaceMaker::new(&config);
        Self {
            sp,
            config,
            storage,
            broker,
            lease,
            interceptors,
            stats,
            metrics: MetricsTemplate,
            shutdown,
            pace,
            cursor: 0,
            token: None,
            last_refresh: Instant::now(),
        }
    }

    /// Drive the worker until shutdown.
    pub(crate) async fn run(mut self) {
        let mut state = WorkerState::Idle;
        loop {
            state = match state {
                WorkerState::Idle => {
                    debug!(lane = %self.sp, "worker starting");
                    WorkerState::Leasing
                }
                WorkerState::Leasing => self.acquire_lease().await,
                WorkerState::Running => self.run_cycles().await,
                WorkerState::Draining => self.drain().await,
                WorkerState::Stopped => break,
            };
        }
    }

    async fn acquire_lease(&mut self) -> WorkerState {
        let resource = self.sp.lock_name();
        loop {
            if *self.shutdown.borrow() {
                return WorkerState::Stopped;
            }
            match self
                .lease
                .try_acquire(&resource, self.config.lease_ttl)
                .await
            {
                Ok(Some(token)) => {
                    debug!(lane = %self.sp, holder = token.holder_id, "lane lease acquired");
                    self.token = Some(token);
                    self.last_refresh = Instant::now();
                    // A previous holder may have deleted rows below our
                    // old cursor; start over from the bottom
                    self.cursor = 0;
                    self.pace = PaceMaker::new(&self.config);
                    return WorkerState::Running;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(lane = %self.sp, error = %err, "lease acquisition failed");
                }
            }
            if self.sleep_or_shutdown(self.config.max_poll_interval).await {
                return WorkerState::Stopped;
            }
        }
    }

    async fn run_cycles(&mut self) -> WorkerState {
        info!(lane = %self.sp, "worker running");
        loop {
            if *self.shutdown.borrow() {
                return WorkerState::Draining;
            }

            let started = Instant::now();
            let outcome = self.cycle().await;
            let polled = outcome.as_ref().map_or(0, |cycle| cycle.polled);
            self.metrics.record_proxy_cycle(self.sp, polled, started);

            match outcome {
                Ok(cycle) => {
                    self.stats.record_cycle();
                    // A vetoed batch re-polls after backoff, not at the
                    // minimum poll interval
                    let delay = if cycle.retry_requested {
                        self.pace.on_error()
                    } else {
                        self.pace.on_success(cycle.polled > 0);
                        self.pace.poll_delay()
                    };
                    if self.sleep_or_shutdown(delay).await {
                        return WorkerState::Draining;
                    }
                }
                Err(OutboxError::ShutdownRequested) => return WorkerState::Draining,
                Err(OutboxError::LeaseLost(resource)) => {
                    self.stats.record_lease_loss();
                    warn!(lane = %self.sp, resource = %resource, "lane lease lost");
                    self.token = None;
                    return WorkerState::Leasing;
                }
                Err(err) => {
                    if matches!(err, OutboxError::Decode { .. }) {
                        // The lane is blocked until the row is fixed or an
                        // interceptor discards it
                        error!(lane = %self.sp, error = %err, "stored message is undecodable, lane halted");
                    } else {
                        warn!(lane = %self.sp, error = %err, "relay cycle failed");
                    }
                    let backoff = self.pace.on_error();
                    if self.sleep_or_shutdown(backoff).await {
                        return WorkerState::Draining;
                    }
                }
            }
        }
    }

    async fn drain(&mut self) -> WorkerState {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.lease.release(&token).await {
                debug!(lane = %self.sp, error = %err, "lease release failed");
            }
        }
        info!(lane = %self.sp, "worker stopped");
        WorkerState::Stopped
    }

    /// One poll-to-delete cycle.
    async fn cycle(&mut self) -> Result<CycleOutcome> {
        self.ensure_lease().await?;

        let rows = self.poll().await?;
        if rows.is_empty() {
            self.metrics
                .record_oldest_message_age(self.sp, Duration::ZERO);
            return Ok(CycleOutcome {
                polled: 0,
                retry_requested: false,
            });
        }
        let polled = rows.len();

        // Decode in id order. A row that cannot be decoded truncates the
        // batch: the clean prefix still goes out, the poison row is
        // retried until an operator intervenes.
        let decode_started = Instant::now();
        let mut batch: Vec<ProxiedRow> = Vec::with_capacity(rows.len());
        let mut poison: Option<(i64, OutboxError)> = None;
        for row in rows {
            match codec::decode(row.id, &row.message) {
                Ok(decoded) => batch.push(ProxiedRow {
                    id: row.id,
                    record: BrokerRecord::from_message(&decoded.message),
                    insert_time: decoded.insert_time,
                    handle: None,
                    outcome: RowOutcome::Pending,
                }),
                Err(err) => {
                    self.stats.record_decode_failure();
                    poison = Some((row.id, err));
                    break;
                }
            }
        }
        self.metrics
            .record_stored_message_parsing(self.sp, decode_started);

        if let Some(first) = batch.first() {
            let age = first
                .insert_time
                .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.metrics
                .record_oldest_message_age(self.sp, Duration::from_millis(age));
        }

        // Pre-publish interceptors. Retry stops the batch before the row;
        // everything from it on stays in the table for the next cycle.
        let mut retry_from: Option<i64> = None;
        let mut keep = batch.len();
        for (index, row) in batch.iter_mut().enumerate() {
            match self.interceptors.before_proxy(&row.record).await {
                ProxyDecision::Send => {}
                ProxyDecision::Discard => row.outcome = RowOutcome::Discarded,
                ProxyDecision::Retry => {
                    retry_from = Some(row.id);
                    keep = index;
                    break;
                }
            }
        }
        batch.truncate(keep);

        // Submit in id order. A failed submit stops further submissions;
        // rows already in flight are still awaited below.
        let mut send_err: Option<OutboxError> = None;
        for row in batch.iter_mut() {
            if row.outcome == RowOutcome::Discarded {
                continue;
            }
            match self.broker.submit(row.record.clone()).await {
                Ok(handle) => row.handle = Some(handle),
                Err(err) => {
                    self.stats.record_send_failure();
                    self.metrics.record_message_send(self.sp, &row.record.topic, false);
                    warn!(lane = %self.sp, id = row.id, error = %err, "broker rejected submission");
                    send_err = Some(err);
                    break;
                }
            }
        }

        // Await acknowledgements in the original poll order.
        let send_started = Instant::now();
        let mut shutdown_hit = false;
        for row in batch.iter_mut() {
            if *self.shutdown.borrow() {
                shutdown_hit = true;
                break;
            }
            if row.outcome == RowOutcome::Discarded {
                continue;
            }
            let Some(handle) = row.handle.take() else {
                // Submission stopped before this row
                break;
            };

            let waited = tokio::select! {
                result = timeout(self.config.send_timeout, handle.wait()) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(OutboxError::broker_send("broker acknowledgement timed out")),
                },
                _ = self.shutdown.changed() => {
                    shutdown_hit = true;
                    break;
                }
            };

            match waited {
                Ok(_ack) => {
                    row.outcome = RowOutcome::Acked;
                    self.stats.record_send_success();
                    self.metrics.record_message_send(self.sp, &row.record.topic, true);
                    if let Some(insert_time) = row.insert_time {
                        self.metrics
                            .record_insert_to_ack(self.sp, &row.record.topic, insert_time);
                    }
                }
                Err(err) => {
                    self.stats.record_send_failure();
                    self.metrics.record_message_send(self.sp, &row.record.topic, false);
                    warn!(lane = %self.sp, id = row.id, error = %err, "broker send failed");
                    match self.interceptors.on_error(&err, &row.record).await {
                        ProxyDecision::Discard => row.outcome = RowOutcome::Discarded,
                        ProxyDecision::Retry | ProxyDecision::Send => {
                            send_err = Some(err);
                            break;
                        }
                    }
                }
            }
        }
        self.metrics.record_broker_messages_send(self.sp, send_started);

        // Delete everything resolved, acked and discarded alike. Rows
        // stay put if the delete fails; redelivery is the contract.
        let resolved: Vec<i64> = batch
            .iter()
            .filter(|row| row.outcome != RowOutcome::Pending)
            .map(|row| row.id)
            .collect();
        if !resolved.is_empty() {
            let delete_started = Instant::now();
            match timeout(
                self.config.delete_timeout,
                self.storage.delete_batch(self.sp, &resolved),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(OutboxError::storage_retryable("delete timed out")),
            }
            self.metrics
                .record_proxy_messages_deletion(self.sp, delete_started);

            let discarded = batch
                .iter()
                .filter(|row| row.outcome == RowOutcome::Discarded)
                .count() as u64;
            self.stats.record_deleted(resolved.len() as u64);
            self.stats.record_discarded(discarded);
        }

        // Cursor: sit just below the first unresolved row so it is polled
        // again. With nothing unresolved, rescan from the bottom; a row
        // from a transaction that committed after our poll passed over its
        // id range would otherwise never be seen.
        let first_pending = batch
            .iter()
            .find(|row| row.outcome == RowOutcome::Pending)
            .map(|row| row.id);
        let first_unresolved = first_pending
            .or(retry_from)
            .or(poison.as_ref().map(|(id, _)| *id));
        self.cursor = first_unresolved.map_or(0, |id| id - 1);

        if shutdown_hit {
            return Err(OutboxError::ShutdownRequested);
        }
        if let Some(err) = send_err {
            return Err(err);
        }
        if let Some((_, err)) = poison {
            return Err(err);
        }
        Ok(CycleOutcome {
            polled,
            retry_requested: retry_from.is_some(),
        })
    }

    /// Refresh the lease when a third of the TTL has passed and verify it
    /// is still ours.
    async fn ensure_lease(&mut self) -> Result<()> {
        let Some(token) = &self.token else {
            return Err(OutboxError::lease_lost(self.sp.lock_name()));
        };
        if self.last_refresh.elapsed() >= self.config.lease_ttl / 3 {
            let refreshed = self
                .lease
                .refresh(token)
                .await
                .unwrap_or(false);
            if !refreshed {
                return Err(OutboxError::lease_lost(token.resource.clone()));
            }
            self.last_refresh = Instant::now();
        }
        if !self.lease.is_held(token) {
            return Err(OutboxError::lease_lost(token.resource.clone()));
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<StoredRow>> {
        let started = Instant::now();
        let rows = tokio::select! {
            result = timeout(
                self.config.poll_query_timeout,
                self.storage.poll_oldest(self.sp, self.cursor, self.config.poll_batch_size),
            ) => match result {
                Ok(rows) => rows?,
                Err(_) => return Err(OutboxError::storage_retryable("poll query timed out")),
            },
            _ = self.shutdown.changed() => return Err(OutboxError::ShutdownRequested),
        };
        self.stats.record_poll(rows.len());
        self.metrics.record_proxy_poll(self.sp, rows.len(), started);
        Ok(rows)
    }

    /// Sleep, but wake early on shutdown. Returns true when shutting down.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.changed() => true,
        }
    }
}
