//! Message publisher.
//!
//! Producers enqueue messages on a bounded channel and block while it is
//! full. A single worker owns the bus client, hands each message to it and
//! watches the delivery outcome in a tracked task. Failed deliveries go back
//! on the channel until they run out of attempts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use domain::models::{CloudEvent, ExportRequest};
use shared::identity::IDENTITY_HEADER;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::message_bus::{MessageBus, MessageBusError, OutboundMessage};
use crate::config::KafkaConfig;
use crate::middleware::metrics::{
    record_dead_letter, record_message_published, record_publish_failure,
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publisher is shut down")]
    Closed,
}

#[derive(Debug)]
struct Envelope {
    message: OutboundMessage,
    attempt: u32,
    enqueued_at: Instant,
}

/// Cloneable handle used to enqueue messages.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Envelope>,
    topic: String,
}

impl Publisher {
    /// Creates the handle and the worker that drains it.
    pub fn new(bus: Arc<dyn MessageBus>, config: &KafkaConfig) -> (Self, PublisherWorker) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let worker = PublisherWorker {
            rx,
            retry_tx: tx.downgrade(),
            bus,
            max_attempts: config.max_delivery_attempts.max(1),
            flush_timeout: config.flush_timeout(),
            deliveries: TaskTracker::new(),
        };
        let publisher = Self {
            tx,
            topic: config.announce_topic.clone(),
        };
        (publisher, worker)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueues one announce message per source of `request`.
    ///
    /// Returns once every message is on the channel, not when the broker
    /// has acknowledged them.
    pub async fn publish(
        &self,
        request: &ExportRequest,
        identity_header: &str,
    ) -> Result<(), PublishError> {
        let now = Utc::now();

        for source in &request.sources {
            let event = CloudEvent::resource_request(request, source, identity_header, now);
            let message = OutboundMessage {
                topic: self.topic.clone(),
                key: request.id.to_string(),
                headers: vec![
                    ("application".to_string(), source.application.clone()),
                    (IDENTITY_HEADER.to_string(), identity_header.to_string()),
                ],
                payload: serde_json::to_vec(&event)?,
            };

            self.tx
                .send(Envelope {
                    message,
                    attempt: 1,
                    enqueued_at: Instant::now(),
                })
                .await
                .map_err(|_| PublishError::Closed)?;

            debug!(
                request_id = %request.id,
                source_id = %source.id,
                application = %source.application,
                "Announce message enqueued"
            );
        }

        Ok(())
    }
}

/// Single consumer of the publisher channel.
pub struct PublisherWorker {
    rx: mpsc::Receiver<Envelope>,
    // Weak so that dropping every `Publisher` closes the channel.
    retry_tx: mpsc::WeakSender<Envelope>,
    bus: Arc<dyn MessageBus>,
    max_attempts: u32,
    flush_timeout: Duration,
    deliveries: TaskTracker,
}

impl PublisherWorker {
    /// Spawns the worker loop.
    pub fn spawn(self) -> PublisherTask {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        PublisherTask {
            shutdown_tx,
            handle,
        }
    }

    /// Runs until shutdown is signalled or every handle is dropped, then
    /// drains the channel and flushes the bus.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(max_attempts = self.max_attempts, "Publisher started");

        loop {
            tokio::select! {
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some(envelope) = self.rx.recv().await {
            self.dispatch(envelope);
            drained += 1;
        }
        info!(drained, "Publisher draining");

        let bus = Arc::clone(&self.bus);
        let timeout = self.flush_timeout;
        match tokio::task::spawn_blocking(move || bus.flush(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to flush message bus"),
            Err(e) => warn!(error = %e, "Flush task panicked"),
        }

        self.deliveries.close();
        if tokio::time::timeout(timeout, self.deliveries.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.deliveries.len(),
                "Timed out waiting for delivery reports"
            );
        }

        info!("Publisher stopped");
    }

    fn dispatch(&self, envelope: Envelope) {
        let retry_tx = self.retry_tx.clone();
        let max_attempts = self.max_attempts;

        match self.bus.send(&envelope.message) {
            Ok(delivery) => {
                self.deliveries.spawn(async move {
                    match delivery.await {
                        Ok(()) => {
                            record_message_published(
                                &envelope.message.topic,
                                envelope.enqueued_at.elapsed().as_secs_f64(),
                            );
                            debug!(
                                topic = %envelope.message.topic,
                                key = %envelope.message.key,
                                attempt = envelope.attempt,
                                "Message delivered"
                            );
                        }
                        Err(e) => requeue(retry_tx, envelope, max_attempts, e).await,
                    }
                });
            }
            Err(e) => {
                self.deliveries
                    .spawn(requeue(retry_tx, envelope, max_attempts, e));
            }
        }
    }
}

async fn requeue(
    retry_tx: mpsc::WeakSender<Envelope>,
    mut envelope: Envelope,
    max_attempts: u32,
    cause: MessageBusError,
) {
    let topic = envelope.message.topic.clone();
    record_publish_failure(&topic);

    if envelope.attempt >= max_attempts {
        record_dead_letter(&topic);
        error!(
            topic = %topic,
            key = %envelope.message.key,
            attempts = envelope.attempt,
            error = %cause,
            "Dropping message after final delivery attempt"
        );
        return;
    }

    warn!(
        topic = %topic,
        key = %envelope.message.key,
        attempt = envelope.attempt,
        error = %cause,
        "Delivery failed, re-enqueueing"
    );
    envelope.attempt += 1;

    let Some(tx) = retry_tx.upgrade() else {
        record_dead_letter(&topic);
        error!(topic = %topic, key = %envelope.message.key, "Publisher closed, dropping message");
        return;
    };
    if let Err(mpsc::error::SendError(envelope)) = tx.send(envelope).await {
        record_dead_letter(&topic);
        error!(topic = %topic, key = %envelope.message.key, "Publisher closed, dropping message");
    }
}

/// Running publisher worker.
pub struct PublisherTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PublisherTask {
    /// Signals the worker and waits for it to drain and flush.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Publisher task panicked: {}", e),
            Err(_) => warn!("Publisher shutdown timed out after {:?}", timeout),
        }
    }
}
