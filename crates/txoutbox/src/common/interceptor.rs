//! Per-record interception hooks
//!
//! Interceptors see every record just before the relay hands it to the
//! broker and again when a send fails. They can discard poison rows or
//! pause a lane without touching the pipeline itself.

use crate::common::broker::BrokerRecord;
use crate::common::error::OutboxError;
use async_trait::async_trait;
use std::sync::Arc;

/// What the relay should do with one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyDecision {
    /// Send the record to the broker
    #[default]
    Send,
    /// Delete the row without sending
    Discard,
    /// Leave the row in place; the lane stops here and retries later
    Retry,
}

/// Hook invoked around the send path of every record.
#[async_trait]
pub trait MessageInterceptor: Send + Sync {
    /// Called in row order before a record is handed to the broker.
    async fn before_proxy(&self, _record: &BrokerRecord) -> ProxyDecision {
        ProxyDecision::Send
    }

    /// Called after a send failure, before the lane decides how to react.
    /// `Retry` keeps the default behavior; `Discard` drops the row.
    /// `Send` is not a meaningful override here and reads as `Retry`.
    async fn on_error(&self, _error: &OutboxError, _record: &BrokerRecord) -> ProxyDecision {
        ProxyDecision::Retry
    }
}

/// Ordered collection of interceptors behaving as one.
#[derive(Default, Clone)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, interceptor: Arc<dyn MessageInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// First decision that is not `Send` wins.
    pub async fn before_proxy(&self, record: &BrokerRecord) -> ProxyDecision {
        for interceptor in &self.interceptors {
            let decision = interceptor.before_proxy(record).await;
            if decision != ProxyDecision::Send {
                return decision;
            }
        }
        ProxyDecision::Send
    }

    /// First decision that is not `Retry` wins; `Send` maps to `Retry`.
    pub async fn on_error(&self, error: &OutboxError, record: &BrokerRecord) -> ProxyDecision {
        for interceptor in &self.interceptors {
            match interceptor.on_error(error, record).await {
                ProxyDecision::Discard => return ProxyDecision::Discard,
                ProxyDecision::Retry | ProxyDecision::Send => {}
            }
        }
        ProxyDecision::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDecision {
        before: ProxyDecision,
        on_error: ProxyDecision,
        before_calls: AtomicUsize,
    }

    impl FixedDecision {
        fn new(before: ProxyDecision, on_error: ProxyDecision) -> Arc<Self> {
            Arc::new(Self {
                before,
                on_error,
                before_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageInterceptor for FixedDecision {
        async fn before_proxy(&self, _record: &BrokerRecord) -> ProxyDecision {
            self.before_calls.fetch_add(1, Ordering::SeqCst);
            self.before
        }

        async fn on_error(&self, _error: &OutboxError, _record: &BrokerRecord) -> ProxyDecision {
            self.on_error
        }
    }

    fn record() -> BrokerRecord {
        BrokerRecord {
            topic: "t".to_string(),
            partition: None,
            key: None,
            timestamp: None,
            headers: Vec::new(),
            value: Bytes::from_static(b"v"),
        }
    }

    #[tokio::test]
    async fn test_empty_chain_defaults() {
        let chain = InterceptorChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.before_proxy(&record()).await, ProxyDecision::Send);
        assert_eq!(
            chain
                .on_error(&OutboxError::broker_send("x"), &record())
                .await,
            ProxyDecision::Retry
        );
    }

    #[tokio::test]
    async fn test_first_non_send_wins() {
        let first = FixedDecision::new(ProxyDecision::Send, ProxyDecision::Retry);
        let second = FixedDecision::new(ProxyDecision::Discard, ProxyDecision::Retry);
        let third = FixedDecision::new(ProxyDecision::Retry, ProxyDecision::Retry);

        let mut chain = InterceptorChain::new();
        chain.add(first.clone());
        chain.add(second.clone());
        chain.add(third.clone());
        assert_eq!(chain.len(), 3);

        assert_eq!(chain.before_proxy(&record()).await, ProxyDecision::Discard);
        // The third interceptor is never consulted
        assert_eq!(first.before_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.before_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.before_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_on_error_send_reads_as_retry() {
        let confused = FixedDecision::new(ProxyDecision::Send, ProxyDecision::Send);
        let mut chain = InterceptorChain::new();
        chain.add(confused);

        assert_eq!(
            chain
                .on_error(&OutboxError::broker_send("x"), &record())
                .await,
            ProxyDecision::Retry
        );
    }

    #[tokio::test]
    async fn test_on_error_discard_override() {
        let passive = FixedDecision::new(ProxyDecision::Send, ProxyDecision::Retry);
        let dropper = FixedDecision::new(ProxyDecision::Send, ProxyDecision::Discard);
        let mut chain = InterceptorChain::new();
        chain.add(passive);
        chain.add(dropper);

        assert_eq!(
            chain
                .on_error(&OutboxError::broker_send("x"), &record())
                .await,
            ProxyDecision::Discard
        );
    }
}
