//! Transport backends.
//!
//! A transport moves opaque [`OutboundRecord`]s to a broker and hands back
//! [`RawRecord`]s. Framing, schemas and commit policy live above this seam.

pub mod memory;
pub mod mqtt;

#[cfg(feature = "kafka")]
pub mod kafka;

use crate::config::{ConsumerConfig, ProducerConfig, TransportKind};
use crate::error::{ClientError, TransportError};
use crate::record::{Delivery, OutboundRecord, RawRecord, TopicPartition};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Publishing half of a transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one record and wait until the configured ack level is met.
    async fn publish(&self, record: OutboundRecord) -> Result<Delivery, TransportError>;

    /// Wait until every accepted record is acknowledged.
    ///
    /// Fails with [`TransportError::Unflushed`] if records remain after
    /// `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Release broker resources. Further publishes fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;
}

/// Subscribing half of a transport, owned by a single consumer.
#[async_trait]
pub trait Subscriber: Send {
    /// Add `topics` to the subscription.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError>;

    /// Fetch up to `max_records`, waiting at most `timeout`.
    ///
    /// Returns an empty batch when nothing arrived in time.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, TransportError>;

    /// Commit positions. Each offset is the next offset to read.
    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<(), TransportError>;

    /// Leave the group and release broker resources.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connect the publisher selected by `config.transport`.
///
/// # Errors
///
/// Returns [`ClientError::ConfigInvalid`] for a backend that is not compiled
/// in, or a transport error if the connection cannot be set up.
pub fn connect_publisher(config: &ProducerConfig) -> Result<Arc<dyn Publisher>, ClientError> {
    match config.transport {
        TransportKind::Mqtt => Ok(Arc::new(mqtt::MqttPublisher::connect(config)?)),
        #[cfg(feature = "kafka")]
        TransportKind::Kafka => Ok(Arc::new(kafka::KafkaPublisher::connect(config)?)),
        #[cfg(not(feature = "kafka"))]
        TransportKind::Kafka => Err(kafka_disabled()),
    }
}

/// Connect the subscriber selected by `config.transport`.
///
/// # Errors
///
/// Returns [`ClientError::ConfigInvalid`] for a backend that is not compiled
/// in, or a transport error if the connection cannot be set up.
pub fn connect_subscriber(config: &ConsumerConfig) -> Result<Box<dyn Subscriber>, ClientError> {
    match config.transport {
        TransportKind::Mqtt => Ok(Box::new(mqtt::MqttSubscriber::connect(config)?)),
        #[cfg(feature = "kafka")]
        TransportKind::Kafka => Ok(Box::new(kafka::KafkaSubscriber::connect(config)?)),
        #[cfg(not(feature = "kafka"))]
        TransportKind::Kafka => Err(kafka_disabled()),
    }
}

#[cfg(not(feature = "kafka"))]
fn kafka_disabled() -> ClientError {
    ClientError::ConfigInvalid(
        "kafka transport requires the `kafka` cargo feature".to_string(),
    )
}

#[cfg(all(test, not(feature = "kafka")))]
mod tests {
    use super::*;

    #[test]
    fn kafka_without_feature_is_a_config_error() {
        let config = ProducerConfig::new("localhost:9092", "http://localhost:8081");
        let err = connect_publisher(&config).err().unwrap();
        assert!(matches!(err, ClientError::ConfigInvalid(_)));
    }
}
