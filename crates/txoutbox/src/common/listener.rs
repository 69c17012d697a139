//! Registration event listeners
//!
//! Listeners run synchronously on the registering task right after a row
//! is inserted, while the caller's transaction is still open. A failing
//! listener is logged and never fails the registration.
//! [`RegisteredMessagesCollector`] is a ready-made listener for test
//! suites that want to assert on what was registered.

use crate::common::error::{OutboxError, Result};
use crate::common::types::{MessageRegisteredEvent, OutboxMessage, ShardPartition};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::warn;

/// Default cap for [`RegisteredMessagesCollector`].
const DEFAULT_COLLECTOR_CAPACITY: usize = 10_000;

/// Observer of successful registrations.
pub trait EventsListener: Send + Sync {
    /// Called once per registered message, in registration order per task.
    fn message_registered(&self, event: &MessageRegisteredEvent) -> Result<()>;
}

/// Shared set of listeners fired on every registration.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn EventsListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventsListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.push(listener);
    }

    /// Remove a previously registered listener, matched by identity.
    pub fn unregister(&self, listener: &Arc<dyn EventsListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire all listeners. Errors are logged, never propagated.
    pub fn fire_message_registered(&self, event: &MessageRegisteredEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(e) = listener.message_registered(event) {
                warn!(
                    storage_id = event.storage_id,
                    lane = %event.shard_partition,
                    error = %e,
                    "registration listener failed"
                );
            }
        }
    }
}

/// One message captured by [`RegisteredMessagesCollector`].
#[derive(Debug, Clone)]
pub struct RegisteredMessage {
    pub shard_partition: ShardPartition,
    pub storage_id: i64,
    pub message: OutboxMessage,
}

#[derive(Default)]
struct CollectorState {
    by_topic: HashMap<String, Vec<RegisteredMessage>>,
    total: usize,
}

/// Listener that keeps every registered message, grouped by topic.
///
/// Collection stops with an error once the cap is hit; a test suite that
/// trips it is registering far more than it asserts on.
pub struct RegisteredMessagesCollector {
    max_messages: usize,
    state: Mutex<CollectorState>,
}

impl RegisteredMessagesCollector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_COLLECTOR_CAPACITY)
    }

    pub fn with_capacity(max_messages: usize) -> Self {
        Self {
            max_messages,
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Messages registered for a topic, in capture order.
    pub fn registered_messages(&self, topic: &str) -> Vec<RegisteredMessage> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.by_topic.get(topic).cloned().unwrap_or_default()
    }

    /// Deserialize the payloads of a topic's messages as JSON.
    pub fn registered_json_messages<T: DeserializeOwned>(&self, topic: &str) -> Result<Vec<T>> {
        let messages = self.registered_messages(topic);
        let mut parsed = Vec::with_capacity(messages.len());
        for captured in messages {
            let value = serde_json::from_slice(&captured.message.value).map_err(|e| {
                OutboxError::validation(format!(
                    "registered message {} is not valid JSON: {}",
                    captured.storage_id, e
                ))
            })?;
            parsed.push(value);
        }
        Ok(parsed)
    }

    /// Total captured messages across topics.
    pub fn count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    /// Forget everything captured so far.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.by_topic.clear();
        state.total = 0;
    }
}

impl Default for RegisteredMessagesCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventsListener for RegisteredMessagesCollector {
    fn message_registered(&self, event: &MessageRegisteredEvent) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.total >= self.max_messages {
            return Err(OutboxError::validation(format!(
                "collector is full at {} messages",
                self.max_messages
            )));
        }
        state.total += 1;
        state
            .by_topic
            .entry(event.message.topic.clone())
            .or_default()
            .push(RegisteredMessage {
                shard_partition: event.shard_partition,
                storage_id: event.storage_id,
                message: event.message.clone(),
            });
        Ok(())
    }
}
