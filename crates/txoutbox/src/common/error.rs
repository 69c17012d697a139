//! Error types for outbox operations
//!
//! One taxonomy for the register path and the relay pipeline, with
//! retryability classification driving backoff and halting decisions.

use thiserror::Error;

/// Outbox-specific errors
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Message rejected before any row was written
    #[error("Validation error: {0}")]
    Validation(String),

    /// Registration attempted without an active database transaction
    #[error("No active transaction: {0}")]
    NoTransaction(String),

    /// Database operation failed
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        /// Transient errors back off and retry; fatal ones halt the lane
        retryable: bool,
    },

    /// Stored blob could not be decoded back into a message
    #[error("Cannot decode stored message {storage_id}: {reason}")]
    Decode { storage_id: i64, reason: String },

    /// Broker rejected or failed a send
    #[error("Broker send error: {0}")]
    BrokerSend(String),

    /// Lease for a lane expired or was taken by another node
    #[error("Lease lost for {0}")]
    LeaseLost(String),

    /// Cooperative shutdown interrupted the operation
    #[error("Shutdown requested")]
    ShutdownRequested,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OutboxError {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new missing-transaction error
    pub fn no_transaction(msg: impl Into<String>) -> Self {
        Self::NoTransaction(msg.into())
    }

    /// Create a transient storage error
    pub fn storage_retryable(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a fatal storage error
    pub fn storage_fatal(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a decode error for a stored row
    pub fn decode(storage_id: i64, reason: impl Into<String>) -> Self {
        Self::Decode {
            storage_id,
            reason: reason.into(),
        }
    }

    /// Create a broker send error
    pub fn broker_send(msg: impl Into<String>) -> Self {
        Self::BrokerSend(msg.into())
    }

    /// Create a lease-lost error
    pub fn lease_lost(resource: impl Into<String>) -> Self {
        Self::LeaseLost(resource.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            // Always retriable
            Self::BrokerSend(_) => true,
            Self::LeaseLost(_) => true,

            Self::Storage { retryable, .. } => *retryable,

            // Non-retriable
            Self::Validation(_)
            | Self::NoTransaction(_)
            | Self::Decode { .. }
            | Self::ShutdownRequested
            | Self::Config(_) => false,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NoTransaction(_) => "no_transaction",
            Self::Storage { .. } => "storage",
            Self::Decode { .. } => "decode",
            Self::BrokerSend(_) => "broker_send",
            Self::LeaseLost(_) => "lease_lost",
            Self::ShutdownRequested => "shutdown",
            Self::Config(_) => "config",
        }
    }
}

/// Check if a SQLSTATE code signals a transient condition.
///
/// Connection exceptions (08xxx), transaction rollbacks (40xxx, deadlocks
/// and serialization failures), insufficient resources (53xxx) and operator
/// intervention (57xxx) are transient. Query cancel (57014) is excluded:
/// that is the relay's own statement timeout firing.
pub fn sqlstate_is_retryable(code: &str) -> bool {
    if code == "57014" {
        return false;
    }
    matches!(code.get(..2), Some("08" | "40" | "53" | "57"))
}

/// Result type for outbox operations
pub type Result<T> = std::result::Result<T, OutboxError>;
