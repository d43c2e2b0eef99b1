//! Kafka implementation of [`MessageBus`].

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use super::message_bus::{DeliveryFuture, MessageBus, MessageBusError, OutboundMessage};
use crate::config::KafkaConfig;

pub struct KafkaMessageBus {
    producer: FutureProducer,
}

impl KafkaMessageBus {
    pub fn new(config: &KafkaConfig) -> Result<Self, MessageBusError> {
        let brokers = config.brokers.join(",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| MessageBusError::Enqueue {
                topic: config.announce_topic.clone(),
                reason: format!("failed to create producer: {}", e),
            })?;

        tracing::info!(
            brokers = %brokers,
            topic = %config.announce_topic,
            "Kafka producer created"
        );

        Ok(Self { producer })
    }
}

fn headers_of(message: &OutboundMessage) -> OwnedHeaders {
    message
        .headers
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

impl MessageBus for KafkaMessageBus {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryFuture, MessageBusError> {
        let record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .key(&message.key)
            .headers(headers_of(message));

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| MessageBusError::Enqueue {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;

        let topic = message.topic.clone();
        Ok(Box::pin(async move {
            match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((e, _))) => Err(MessageBusError::Delivery {
                    topic,
                    reason: e.to_string(),
                }),
                Err(_) => Err(MessageBusError::Delivery {
                    topic,
                    reason: "delivery cancelled".to_string(),
                }),
            }
        }))
    }

    fn flush(&self, timeout: Duration) -> Result<(), MessageBusError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| MessageBusError::Flush(e.to_string()))
    }
}
