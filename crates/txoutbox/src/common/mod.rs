//! # Common Outbox Types and Traits
//!
//! This module contains the storage-agnostic core of the transactional
//! outbox:
//!
//! - [`OutboxMessage`] - What producers hand to the outbox
//! - [`TransactionalMessageSender`] - Register path inside the caller's transaction
//! - [`OutboxRelay`] - Supervisor that drives one worker per lane
//! - [`OutboxStorage`] / [`OutboxTransaction`] - Database seam
//! - [`BrokerProducer`] - Broker seam with asynchronous delivery handles
//! - [`LeaseCoordinator`] - One active worker per lane across processes
//! - [`MessageInterceptor`] - Per-record send/discard/retry hooks
//! - [`EventsListener`] - Registration observers
//! - [`codec`] - Versioned blob format with pluggable compression
//! - [`PaceMaker`] - Adaptive poll intervals and error backoff
//! - [`RelayConfig`] - Shards, partitions, batch sizes, timeouts
//! - [`MetricsTemplate`] - Stable `tw.tkms.*` metric names
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Transactional Outbox                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  caller txn ──► MessageSender ──► outgoing_message_<shard>  │
//! │                 (validate, encode, insert; atomic commit)   │
//! │                                                             │
//! │  OutboxRelay ──► one worker per (shard,partition) lane      │
//! │    poll ──► decode ──► intercept ──► submit ──► await acks  │
//! │    in id order ──► delete resolved rows ──► loop            │
//! │                                                             │
//! │  BrokerProducer  ←─── Kafka-compatible delivery             │
//! │  LeaseCoordinator ←── exclusive lane ownership, TTL leases  │
//! │  PaceMaker       ←─── poll pacing and error backoff        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod broker;
pub mod codec;
mod compression;
mod config;
mod error;
mod interceptor;
mod lease;
mod listener;
mod metrics;
mod pacemaker;
mod producer;
mod relay;
mod storage;
mod types;
mod worker;

pub use broker::*;
pub use codec::{DecodedMessage, EncodedMessage};
pub use compression::*;
pub use config::*;
pub use error::*;
pub use interceptor::*;
pub use lease::*;
pub use listener::*;
pub use metrics::*;
pub use pacemaker::*;
pub use producer::*;
pub use relay::*;
pub use storage::*;
pub use types::*;
