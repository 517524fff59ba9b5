//! Kafka transport via `rdkafka`.
//!
//! Offsets are committed explicitly by the consumer (`enable.auto.commit`
//! is off) so the commit policy above this layer decides when positions move.

use super::{Publisher, Subscriber};
use crate::config::{AutoOffsetReset, ConsumerConfig, ProducerConfig};
use crate::error::{ClientError, TransportError};
use crate::record::{Delivery, Headers, OutboundRecord, RawRecord, TopicPartition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeSet;
use std::time::Duration;

/// Kafka publisher backed by a `FutureProducer`.
pub struct KafkaPublisher {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaPublisher {
    /// Build the producer from `config`.
    ///
    /// # Errors
    ///
    /// Returns error if librdkafka rejects the configuration.
    pub fn connect(config: &ProducerConfig) -> Result<Self, ClientError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", config.acks.as_kafka_str())
            .set("enable.idempotence", config.enable_idempotence.to_string())
            .set(
                "max.in.flight.requests.per.connection",
                config.max_in_flight.to_string(),
            )
            .set("linger.ms", config.linger.as_millis().to_string())
            .set("batch.size", config.batch_max_bytes.to_string())
            .set("compression.type", config.compression.as_kafka_str())
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            );
        if let Some(client_id) = &config.client_id {
            client.set("client.id", client_id);
        }

        let producer: FutureProducer = client
            .create()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            acks = config.acks.as_kafka_str(),
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            queue_timeout: config.message_timeout,
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<Delivery, TransportError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }

        let mut future_record = FutureRecord::<[u8], [u8]>::to(&record.topic)
            .payload(record.value.as_slice())
            .headers(headers)
            .timestamp(record.timestamp.timestamp_millis());
        if !record.key.is_empty() {
            future_record = future_record.key(record.key.as_slice());
        }

        match self.producer.send(future_record, self.queue_timeout).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((err, _)) => Err(TransportError::Publish(err.to_string())),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || {
            producer.flush(Timeout::After(timeout)).is_ok()
        })
        .await
        .map_err(|e| TransportError::Publish(format!("flush task failed: {e}")))?;

        if flushed {
            Ok(())
        } else {
            let remaining = usize::try_from(self.producer.in_flight_count()).unwrap_or(0);
            Err(TransportError::Unflushed { remaining })
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        // librdkafka tears the producer down on drop
        Ok(())
    }
}

/// Kafka subscriber backed by a `StreamConsumer`.
pub struct KafkaSubscriber {
    consumer: StreamConsumer,
    topics: BTreeSet<String>,
}

impl KafkaSubscriber {
    /// Build the consumer from `config`.
    ///
    /// # Errors
    ///
    /// Returns error if librdkafka rejects the configuration.
    pub fn connect(config: &ConsumerConfig) -> Result<Self, ClientError> {
        let reset = match config.auto_offset_reset {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .create()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.group_id,
            "Kafka consumer created"
        );

        Ok(Self {
            consumer,
            topics: BTreeSet::new(),
        })
    }
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawRecord {
    let mut headers = Headers::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            let value = header
                .value
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            headers.insert(header.key.to_string(), value);
        }
    }

    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    RawRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp,
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        let before = self.topics.len();
        self.topics.extend(topics.iter().cloned());
        if self.topics.len() == before {
            return Ok(());
        }

        let all: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        tracing::info!(topics = ?all, "Subscribing to Kafka topics");
        self.consumer
            .subscribe(&all)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, TransportError> {
        let mut batch = Vec::new();

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(batch),
            Ok(Err(e)) => return Err(TransportError::Poll(e.to_string())),
            Ok(Ok(message)) => batch.push(to_raw(&message)),
        }

        // drain whatever is already buffered without waiting again
        while batch.len() < max_records {
            match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(to_raw(&message)),
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Kafka error while draining batch");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<(), TransportError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut list = TopicPartitionList::new();
        for (tp, offset) in offsets {
            list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))
                .map_err(|e| TransportError::Commit(e.to_string()))?;
        }
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| TransportError::Commit(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
