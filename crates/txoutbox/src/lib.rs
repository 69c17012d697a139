//! # txoutbox - Transactional Outbox Relay
//!
//! Reliable, ordered message publishing from a relational database to a
//! Kafka-compatible broker. Messages are enlisted in the caller's own
//! database transaction and relayed asynchronously with at-least-once
//! delivery and per-lane FIFO ordering.
//!
//! ## Features
//!
//! - `postgres` - PostgreSQL storage backend via tokio-postgres
//! - `mysql` - MySQL storage backend via mysql_async
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  send_message   ┌──────────────────────────┐
//! │ Application │ ──────────────► │ outgoing_message_<shard>  │
//! │ transaction │    (encoded)    │ (commits with your data)  │
//! └─────────────┘                 └────────────┬─────────────┘
//!                                              │ poll by id
//!                                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                       OutboxRelay                        │
//! │   one leased worker per (shard, partition) lane:         │
//! │   poll ► decode ► intercept ► submit ► await acks ►      │
//! │   delete resolved rows                                   │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ in id order
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              BrokerProducer (Kafka-compatible)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> txoutbox::Result<()> {
//! use std::sync::Arc;
//!
//! use txoutbox::common::{MemoryBroker, MemoryStorage};
//! use txoutbox::{OutboxMessage, OutboxRelay, RelayConfig};
//!
//! let config = RelayConfig::default().with_partitions_count(4);
//! let storage = Arc::new(MemoryStorage::new(Arc::new(config.clone())));
//! let broker = Arc::new(MemoryBroker::new(4));
//!
//! let relay = OutboxRelay::builder()
//!     .config(config)
//!     .storage(storage.clone())
//!     .broker(broker)
//!     .build()?;
//! relay.start().await?;
//!
//! // Enlist a message in the same transaction as the business write.
//! let mut txn = storage.begin();
//! let sender = relay.sender();
//! sender
//!     .send_message(&mut txn, OutboxMessage::new("orders", r#"{"id":1}"#))
//!     .await?;
//! txn.commit().await;
//!
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! This crate exposes types in three tiers:
//!
//! ### Tier 1: Core Types (crate root)
//! Essential types for registering and relaying messages - `OutboxRelay`,
//! `OutboxMessage`, `RelayConfig`.
//!
//! ### Tier 2: Seam Traits (crate root)
//! Traits for plugging in storage, broker, lease, interceptor, and
//! listener implementations.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! In-memory implementations, the blob codec, poll pacing, and metric
//! names - accessed via `common::*`.

// Common module - always available (contains advanced/internal types)
pub mod common;

// =============================================================================
// TIER 1: Core Types - Essential for registering and relaying messages
// =============================================================================

pub use common::{
    // Error handling
    OutboxError,
    // What producers hand to the outbox
    OutboxMessage,
    // Relay lifecycle
    OutboxRelay,
    RelayBuilder,
    RelayConfig,
    RelayStatsSnapshot,
    Result,
    SendResult,
    // Register path
    TransactionalMessageSender,
};

// =============================================================================
// TIER 2: Seam Traits - Plug in your own backends
// =============================================================================

// Storage seam
pub use common::{InsertResult, OutboxStorage, OutboxTransaction, StoredRow};

// Broker seam
pub use common::{BrokerProducer, BrokerRecord, DeliveryHandle, RecordAck};

// Lease coordination
pub use common::{LeaseCoordinator, LeaseToken};

// Interceptors
pub use common::{InterceptorChain, MessageInterceptor, ProxyDecision};

// Registration listeners
pub use common::{EventsListener, MessageRegisteredEvent};

// Message building blocks
pub use common::{CompressionAlgorithm, DatabaseDialect, MessageHeader, ShardPartition};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
// The following are NOT re-exported at crate root but accessible via `common::`:
//
// In-memory implementations (tests, examples, single-process setups):
//   - common::MemoryStorage, MemoryTransaction
//   - common::MemoryBroker, DeliveredRecord
//   - common::MemoryLeaseCoordinator
//
// Blob format (for custom storage backends):
//   - common::codec::{encode, decode}
//   - common::{DecodedMessage, EncodedMessage}
//
// Poll pacing and metrics (for custom workers):
//   - common::PaceMaker
//   - common::MetricsTemplate
//
// Listener utilities:
//   - common::{ListenerRegistry, RegisteredMessage, RegisteredMessagesCollector}

// PostgreSQL storage backend - feature-gated
#[cfg(feature = "postgres")]
pub mod postgres;

// MySQL storage backend - feature-gated
#[cfg(feature = "mysql")]
pub mod mysql;
