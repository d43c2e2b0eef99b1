//! Message bus capability used to announce work to upstream applications.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageBusError {
    /// The client refused the message (queue full, closed, misconfigured).
    #[error("failed to enqueue message for {topic}: {reason}")]
    Enqueue { topic: String, reason: String },

    /// The broker reported that the message was not delivered.
    #[error("delivery to {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },

    #[error("flush failed: {0}")]
    Flush(String),
}

/// One message as handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Resolves once the broker acknowledges or rejects a message.
pub type DeliveryFuture = Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send>>;

/// Producer side of a message bus.
///
/// `send` hands the message to the client and returns without waiting for
/// the broker; the returned future reports the delivery outcome.
pub trait MessageBus: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryFuture, MessageBusError>;

    /// Blocks until queued messages are delivered or `timeout` passes.
    fn flush(&self, timeout: Duration) -> Result<(), MessageBusError>;
}

/// Bus that records every delivered message in memory.
#[derive(Default)]
pub struct MemoryMessageBus {
    delivered: Mutex<Vec<OutboundMessage>>,
    fail_deliveries: AtomicUsize,
    fail_always: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` deliveries fail.
    pub fn fail_next_deliveries(&self, count: usize) {
        self.fail_deliveries.store(count, Ordering::SeqCst);
    }

    /// Makes every delivery fail until cleared.
    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Every message the bus accepted, in delivery order.
    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn delivered_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.delivered()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Number of `send` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.fail_always.load(Ordering::SeqCst)
            || self
                .fail_deliveries
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl MessageBus for MemoryMessageBus {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryFuture, MessageBusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let outcome = if self.should_fail() {
            Err(MessageBusError::Delivery {
                topic: message.topic.clone(),
                reason: "injected delivery failure".to_string(),
            })
        } else {
            self.delivered
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(message.clone());
            Ok(())
        };

        Ok(Box::pin(async move { outcome }))
    }

    fn flush(&self, _timeout: Duration) -> Result<(), MessageBusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            key: "k".to_string(),
            headers: vec![("application".to_string(), "advisor".to_string())],
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_memory_bus_records_deliveries() {
        let bus = MemoryMessageBus::new();
        bus.send(&message("a")).unwrap().await.unwrap();
        bus.send(&message("b")).unwrap().await.unwrap();

        assert_eq!(bus.delivered().len(), 2);
        assert_eq!(bus.delivered_to("a").len(), 1);
        assert_eq!(bus.delivered()[0].header("application"), Some("advisor"));
        assert_eq!(bus.attempts(), 2);
    }

    #[tokio::test]
    async fn test_memory_bus_injected_failures() {
        let bus = MemoryMessageBus::new();
        bus.fail_next_deliveries(1);

        let first = bus.send(&message("a")).unwrap().await;
        assert!(matches!(first, Err(MessageBusError::Delivery { .. })));
        bus.send(&message("a")).unwrap().await.unwrap();

        assert_eq!(bus.delivered().len(), 1);
        assert_eq!(bus.attempts(), 2);
    }
}
