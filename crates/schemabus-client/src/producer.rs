//! Schema-aware producer.

use crate::config::{ProducerConfig, SerializationMode};
use crate::error::{ClientError, TransportError};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::record::{Delivery, Headers, OutboundRecord};
use crate::transport::{self, Publisher};
use chrono::Utc;
use schemabus_registry::{HttpSchemaRegistry, ParsedSchema, SchemaCache, SchemaHandle};
use schemabus_wire::{SubjectKind, SubjectNameStrategy};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Publishes domain values as framed, schema-encoded records.
///
/// All produce calls are synchronous with respect to the broker: they return
/// once the configured acknowledgement level is met. A `Producer` can be
/// shared across tasks behind an `Arc`.
pub struct Producer {
    config: ProducerConfig,
    publisher: Arc<dyn Publisher>,
    cache: Arc<SchemaCache>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Producer {
    /// Validate `config`, connect the configured transport and an HTTP
    /// registry client with its own schema cache.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] for a bad config, or a
    /// transport error if the broker client cannot be created.
    pub async fn connect(config: ProducerConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let registry = HttpSchemaRegistry::new(config.registry_client_config())
            .map_err(|e| ClientError::ConfigInvalid(e.to_string()))?;
        let publisher = transport::connect_publisher(&config)?;
        Self::with_parts(config, publisher, Arc::new(SchemaCache::new(Arc::new(registry))))
    }

    /// Assemble a producer from an existing publisher and schema cache.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] for a bad config.
    pub fn with_parts(
        config: ProducerConfig,
        publisher: Arc<dyn Publisher>,
        cache: Arc<SchemaCache>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            publisher,
            cache,
            metrics: Arc::new(NoopMetrics),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Report metrics to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Abort in-flight and future produce calls when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this producer's operations.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Schema cache used by this producer.
    #[must_use]
    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Configuration this producer was built with.
    #[must_use]
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Serialize `value` with the latest schema of the topic's value subject
    /// and publish it.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Schema`] if the subject cannot be resolved
    /// - [`ClientError::Serialization`] if `value` does not fit the schema
    /// - [`ClientError::Transport`] / [`ClientError::Timeout`] on publish failure
    /// - [`ClientError::Cancelled`] if the cancellation token fires
    pub async fn produce<T>(
        &self,
        topic: &str,
        key: &[u8],
        value: &T,
    ) -> Result<Delivery, ClientError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.produce_with_headers(topic, key, value, Headers::new())
            .await
    }

    /// [`Producer::produce`] with string headers attached.
    ///
    /// # Errors
    ///
    /// See [`Producer::produce`].
    #[tracing::instrument(level = "debug", skip_all, fields(topic = %topic), err)]
    pub async fn produce_with_headers<T>(
        &self,
        topic: &str,
        key: &[u8],
        value: &T,
        headers: Headers,
    ) -> Result<Delivery, ClientError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let value = to_json(topic, value)?;
        let result = self
            .guarded(async {
                let bytes = match self.config.serialization {
                    SerializationMode::Json => json_bytes(topic, &value)?,
                    SerializationMode::Schema => {
                        let subject =
                            self.config
                                .subject_strategy
                                .subject(topic, SubjectKind::Value, None);
                        let handle = self
                            .cache
                            .resolve_latest(&subject)
                            .await
                            .map_err(|source| ClientError::Schema {
                                topic: topic.to_string(),
                                source,
                            })?;
                        frame(topic, &handle, &value)?
                    }
                };
                self.send(topic, key, bytes, headers).await
            })
            .await;
        self.record_outcome(topic, &result);
        result
    }

    /// Serialize `value` with `schema_text`, registering the schema under the
    /// topic's value subject on first use.
    ///
    /// Repeated calls with identical text register at most once.
    ///
    /// # Errors
    ///
    /// See [`Producer::produce`]; registration failures are reported as
    /// [`ClientError::Schema`].
    #[tracing::instrument(level = "debug", skip_all, fields(topic = %topic), err)]
    pub async fn produce_with_schema<T>(
        &self,
        topic: &str,
        key: &[u8],
        value: &T,
        schema_text: &str,
    ) -> Result<Delivery, ClientError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let value = to_json(topic, value)?;
        let result = self
            .guarded(async {
                let bytes = match self.config.serialization {
                    SerializationMode::Json => json_bytes(topic, &value)?,
                    SerializationMode::Schema => {
                        let subject = self.subject_for_schema(topic, schema_text);
                        let handle = self
                            .cache
                            .resolve_or_register(&subject, schema_text, self.config.schema_format)
                            .await
                            .map_err(|source| ClientError::Schema {
                                topic: topic.to_string(),
                                source,
                            })?;
                        frame(topic, &handle, &value)?
                    }
                };
                self.send(topic, key, bytes, Headers::new()).await
            })
            .await;
        self.record_outcome(topic, &result);
        result
    }

    /// Publish bytes as-is, without schema work or framing.
    ///
    /// # Errors
    ///
    /// Transport, timeout and cancellation errors as for [`Producer::produce`].
    #[tracing::instrument(level = "debug", skip_all, fields(topic = %topic), err)]
    pub async fn produce_raw(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: Headers,
    ) -> Result<Delivery, ClientError> {
        let result = self
            .guarded(self.send(topic, key, value.to_vec(), headers))
            .await;
        self.record_outcome(topic, &result);
        result
    }

    /// Wait until every accepted record is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if records are still unacknowledged
    /// after `timeout`; the producer stays usable.
    pub async fn flush(&self, timeout: Duration) -> Result<(), ClientError> {
        match self.guarded(async {
            self.publisher.flush(timeout).await.map_err(ClientError::from)
        })
        .await
        {
            Err(ClientError::Transport(TransportError::Unflushed { remaining })) => {
                tracing::warn!(remaining, ?timeout, "Flush timed out");
                Err(ClientError::Timeout {
                    operation: "flush",
                    after: timeout,
                })
            }
            other => other,
        }
    }

    /// Flush with the configured close timeout and release the transport.
    ///
    /// Calling `close` twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to shut down.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.publisher.flush(self.config.close_timeout).await {
            tracing::warn!(error = %err, "Flush before close failed");
        }
        self.publisher.close().await?;
        tracing::info!("Producer closed");
        Ok(())
    }

    fn subject_for_schema(&self, topic: &str, schema_text: &str) -> String {
        let strategy = self.config.subject_strategy;
        let record_name = match strategy {
            SubjectNameStrategy::TopicName => None,
            _ => ParsedSchema::parse(self.config.schema_format, schema_text)
                .ok()
                .and_then(|parsed| parsed.record_name()),
        };
        strategy.subject(topic, SubjectKind::Value, record_name.as_deref())
    }

    async fn guarded<T, F>(&self, operation: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ClientError::Cancelled),
            result = operation => result,
        }
    }

    async fn send(
        &self,
        topic: &str,
        key: &[u8],
        value: Vec<u8>,
        headers: Headers,
    ) -> Result<Delivery, ClientError> {
        let record = OutboundRecord {
            topic: topic.to_string(),
            key: key.to_vec(),
            value,
            headers,
            timestamp: Utc::now(),
        };

        let started = Instant::now();
        let timeout = self.config.message_timeout;
        let delivery = tokio::time::timeout(timeout, self.publisher.publish(record))
            .await
            .map_err(|_| ClientError::Timeout {
                operation: "publish",
                after: timeout,
            })??;

        self.metrics.observe(
            metrics::PRODUCE_SECONDS,
            &[("topic", topic)],
            started.elapsed().as_secs_f64(),
        );
        tracing::debug!(
            topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "Record delivered"
        );
        Ok(delivery)
    }

    fn record_outcome(&self, topic: &str, result: &Result<Delivery, ClientError>) {
        match result {
            Ok(_) => self
                .metrics
                .increment(metrics::MESSAGES_PRODUCED, &[("topic", topic)]),
            Err(ClientError::Cancelled) => {}
            Err(err) => self
                .metrics
                .increment(metrics::ERRORS, &[("topic", topic), ("kind", err.kind())]),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(topic: &str, value: &T) -> Result<serde_json::Value, ClientError> {
    serde_json::to_value(value).map_err(|e| ClientError::Serialization {
        topic: topic.to_string(),
        message: e.to_string(),
    })
}

fn json_bytes(topic: &str, value: &serde_json::Value) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(value).map_err(|e| ClientError::Serialization {
        topic: topic.to_string(),
        message: e.to_string(),
    })
}

fn frame(topic: &str, handle: &SchemaHandle, value: &serde_json::Value) -> Result<Vec<u8>, ClientError> {
    let payload = handle
        .parsed()
        .serialize(value)
        .map_err(|e| ClientError::Serialization {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
    Ok(schemabus_wire::encode(handle.id(), &payload))
}
