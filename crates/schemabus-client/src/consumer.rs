//! Schema-aware consumer.
//!
//! The consume loop polls a batch, then for each record splits the frame,
//! resolves the schema id through the cache, deserializes, and hands a
//! [`Record`] to the caller's handler. Offsets are tracked as "next offset
//! to read" per partition and committed according to [`CommitPolicy`].
//!
//! A record that cannot be decoded never stops the stream: it is delivered
//! as [`Payload::Raw`] with a warning and a fallback counter.

use crate::config::{CommitPolicy, ConsumerConfig, HandlerErrorPolicy, SerializationMode};
use crate::error::{BoxError, ClientError};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::record::{Payload, RawRecord, Record, TopicPartition};
use crate::transport::{self, Subscriber};
use schemabus_registry::{HttpSchemaRegistry, SchemaCache};
use schemabus_wire::Frame;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, not yet subscribed
    Created,
    /// Subscribed, not currently polling
    Subscribed,
    /// Waiting on the transport
    Polling,
    /// Running the handler
    Handling,
    /// Committing offsets
    Committing,
    /// Stopped on a handler failure under [`HandlerErrorPolicy::FailFast`];
    /// only `commit` and `close` are allowed
    Failed,
    /// Closed; every operation fails with [`ClientError::Closed`]
    Closed,
}

/// Pulls framed records, decodes them and drives a handler.
pub struct Consumer {
    config: ConsumerConfig,
    subscriber: Box<dyn Subscriber>,
    cache: Arc<SchemaCache>,
    metrics: Arc<dyn MetricsSink>,
    state: ConsumerState,
    topics: BTreeSet<String>,
    buffered: VecDeque<RawRecord>,
    pending: BTreeMap<TopicPartition, i64>,
    last_commit: Instant,
    failed_at: Option<(TopicPartition, i64)>,
}

impl Consumer {
    /// Validate `config`, connect the configured transport and an HTTP
    /// registry client with its own schema cache.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] for a bad config, or a
    /// transport error if the broker client cannot be created.
    pub async fn connect(config: ConsumerConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let registry = HttpSchemaRegistry::new(config.registry_client_config())
            .map_err(|e| ClientError::ConfigInvalid(e.to_string()))?;
        let subscriber = transport::connect_subscriber(&config)?;
        Self::with_parts(config, subscriber, Arc::new(SchemaCache::new(Arc::new(registry))))
    }

    /// Assemble a consumer from an existing subscriber and schema cache.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] for a bad config.
    pub fn with_parts(
        config: ConsumerConfig,
        subscriber: Box<dyn Subscriber>,
        cache: Arc<SchemaCache>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            subscriber,
            cache,
            metrics: Arc::new(NoopMetrics),
            state: ConsumerState::Created,
            topics: BTreeSet::new(),
            buffered: VecDeque::new(),
            pending: BTreeMap::new(),
            last_commit: Instant::now(),
            failed_at: None,
        })
    }

    /// Report metrics to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Schema cache used by this consumer.
    #[must_use]
    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Topics subscribed so far.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    /// Handled offsets not yet committed, as next offset per partition.
    #[must_use]
    pub fn uncommitted(&self) -> &BTreeMap<TopicPartition, i64> {
        &self.pending
    }

    /// Add `topics` to the subscription. Topics already subscribed are
    /// ignored, so repeated calls are harmless.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close, [`ClientError::Halted`]
    /// after a fail-fast handler error, or a transport error.
    pub async fn subscribe(&mut self, topics: &[String]) -> Result<(), ClientError> {
        self.ensure_active()?;
        let new: Vec<String> = topics
            .iter()
            .filter(|topic| !self.topics.contains(*topic))
            .cloned()
            .collect();
        if !new.is_empty() {
            self.subscriber.subscribe(&new).await?;
            tracing::info!(topics = ?new, group_id = %self.config.group_id, "Subscribed");
            self.topics.extend(new);
        }
        if self.state == ConsumerState::Created {
            self.state = ConsumerState::Subscribed;
        }
        Ok(())
    }

    /// Run the consume loop until `cancel` fires or the handler fails under
    /// [`HandlerErrorPolicy::FailFast`].
    ///
    /// Cancellation interrupts a pending poll and returns
    /// [`ClientError::Cancelled`]. A running handler is allowed to finish.
    ///
    /// After a [`ClientError::Handler`] error the failed record is neither
    /// marked nor committed, the rest of the polled batch is dropped, and the
    /// consumer enters [`ConsumerState::Failed`]. Further `consume` calls
    /// return [`ClientError::Halted`]; close the consumer so the group
    /// resumes from the failed record.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Cancelled`] when `cancel` fires
    /// - [`ClientError::Handler`] on handler failure with `FailFast`
    /// - [`ClientError::Halted`] if an earlier call failed that way
    /// - [`ClientError::Transport`] when polling keeps failing past
    ///   `max_poll_retries`, or a synchronous commit fails
    pub async fn consume<F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut handler: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(Record) -> Fut + Send,
        Fut: Future<Output = Result<(), BoxError>> + Send,
    {
        self.ensure_active()?;
        self.ensure_subscribed().await?;
        tracing::info!(group_id = %self.config.group_id, "Consume loop started");

        loop {
            if cancel.is_cancelled() {
                self.state = ConsumerState::Subscribed;
                return Err(ClientError::Cancelled);
            }
            let Some(raw) = self.next_raw(cancel, self.config.poll_interval).await? else {
                self.maybe_auto_commit().await;
                continue;
            };

            let tp = raw.topic_partition();
            let offset = raw.offset;
            let record = self.decode(raw).await;

            self.state = ConsumerState::Handling;
            let started = Instant::now();
            let outcome = handler(record).await;
            self.metrics.observe(
                metrics::PROCESSING_SECONDS,
                &[("topic", tp.topic.as_str())],
                started.elapsed().as_secs_f64(),
            );

            match outcome {
                Ok(()) => {
                    self.metrics
                        .increment(metrics::MESSAGES_CONSUMED, &[("topic", tp.topic.as_str())]);
                    self.mark(&tp, offset);
                }
                Err(source) => {
                    self.metrics.increment(
                        metrics::ERRORS,
                        &[("topic", tp.topic.as_str()), ("kind", "handler")],
                    );
                    match self.config.handler_error_policy {
                        HandlerErrorPolicy::FailFast => {
                            self.halt(tp.clone(), offset);
                            return Err(ClientError::Handler {
                                topic: tp.topic,
                                partition: tp.partition,
                                offset,
                                source,
                            });
                        }
                        HandlerErrorPolicy::LogAndContinue => {
                            tracing::warn!(
                                topic = %tp.topic,
                                partition = tp.partition,
                                offset,
                                error = %source,
                                "Handler failed, skipping record"
                            );
                            self.mark(&tp, offset);
                        }
                    }
                }
            }

            self.after_record().await?;
        }
    }

    /// Receive and decode a single record, waiting at most `timeout`.
    ///
    /// The returned record counts as handled for commit purposes.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if nothing arrives in time
    /// - [`ClientError::Transport`] on a non-retriable poll failure
    /// - [`ClientError::Halted`] after a fail-fast handler error
    pub async fn consume_once(&mut self, timeout: Duration) -> Result<Record, ClientError> {
        self.ensure_active()?;
        self.ensure_subscribed().await?;

        let never = CancellationToken::new();
        let poll_interval = self.config.poll_interval.min(timeout);
        let received = tokio::time::timeout(timeout, async {
            loop {
                if let Some(raw) = self.next_raw(&never, poll_interval).await? {
                    return Ok::<_, ClientError>(raw);
                }
            }
        })
        .await;

        let raw = match received {
            Ok(result) => result?,
            Err(_) => {
                self.state = ConsumerState::Subscribed;
                return Err(ClientError::Timeout {
                    operation: "consume_once",
                    after: timeout,
                });
            }
        };

        let tp = raw.topic_partition();
        let offset = raw.offset;
        let record = self.decode(raw).await;
        self.metrics
            .increment(metrics::MESSAGES_CONSUMED, &[("topic", tp.topic.as_str())]);
        self.mark(&tp, offset);
        self.after_record().await?;
        self.state = ConsumerState::Subscribed;
        Ok(record)
    }

    /// Commit every handled offset.
    ///
    /// Offsets stay pending if the commit fails, so a later call retries them.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close, or a transport error.
    pub async fn commit(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }

        let previous = self.state;
        self.state = ConsumerState::Committing;
        let offsets: Vec<(TopicPartition, i64)> = self
            .pending
            .iter()
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        let result = self.subscriber.commit(&offsets).await;
        self.state = previous;
        result?;

        for (tp, offset) in &offsets {
            tracing::debug!(%tp, offset, "Offset committed");
            // a newer offset may have been marked meanwhile
            if self.pending.get(tp) == Some(offset) {
                self.pending.remove(tp);
            }
        }
        self.last_commit = Instant::now();
        Ok(())
    }

    /// Commit what was handled (unless the policy is manual) and leave the
    /// group. Calling `close` twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to shut down.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if self.state == ConsumerState::Closed {
            return Ok(());
        }
        if self.config.commit_policy != CommitPolicy::Manual {
            if let Err(err) = self.commit().await {
                tracing::warn!(error = %err, "Final commit failed");
            }
        }
        self.state = ConsumerState::Closed;
        self.buffered.clear();
        self.subscriber.close().await?;
        tracing::info!(group_id = %self.config.group_id, "Consumer closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.state == ConsumerState::Closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_active(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        match &self.failed_at {
            Some((tp, offset)) => Err(ClientError::Halted {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: *offset,
            }),
            None => Ok(()),
        }
    }

    /// Records behind the failed one were fetched but never handled; drop
    /// them so nothing past the failure can be marked.
    fn halt(&mut self, tp: TopicPartition, offset: i64) {
        let dropped = self.buffered.len();
        self.buffered.clear();
        tracing::error!(%tp, offset, dropped, "Handler failed, consumer halted");
        self.failed_at = Some((tp, offset));
        self.state = ConsumerState::Failed;
    }

    async fn ensure_subscribed(&mut self) -> Result<(), ClientError> {
        if self.state == ConsumerState::Created {
            let topics = self.config.topics.clone();
            self.subscribe(&topics).await?;
        }
        Ok(())
    }

    /// Next buffered record, polling the transport when the buffer is empty.
    /// `Ok(None)` means the poll timed out.
    async fn next_raw(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<RawRecord>, ClientError> {
        if let Some(raw) = self.buffered.pop_front() {
            return Ok(Some(raw));
        }

        self.state = ConsumerState::Polling;
        let max_records = self.config.max_poll_records;
        let mut failures = 0;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = self.subscriber.poll(max_records, timeout) => result,
            };

            match result {
                Ok(batch) => {
                    self.buffered.extend(batch);
                    return Ok(self.buffered.pop_front());
                }
                Err(err) if err.is_retriable() && failures < self.config.max_poll_retries => {
                    failures += 1;
                    tracing::warn!(error = %err, attempt = failures, "Poll failed, retrying");
                    self.metrics.increment(metrics::ERRORS, &[("kind", "poll")]);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(ClientError::Cancelled),
                        () = tokio::time::sleep(RETRY_BACKOFF * failures) => {}
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "Poll failed");
                    return Err(err.into());
                }
            }
        }
    }

    async fn decode(&self, raw: RawRecord) -> Record {
        let (payload, schema_id) = match Frame::parse(&raw.value) {
            Err(err) => {
                let payload = match self.config.serialization {
                    SerializationMode::Json => serde_json::from_slice(&raw.value)
                        .map_or_else(|_| Payload::Raw(raw.value.clone()), Payload::Decoded),
                    SerializationMode::Schema => Payload::Raw(raw.value.clone()),
                };
                if !payload.is_decoded() {
                    self.fallback(&raw, None, "unframed", &err);
                }
                (payload, None)
            }
            Ok(frame) => {
                let id = frame.schema_id();
                let payload = match self.cache.resolve_by_id(id).await {
                    Ok(handle) => match handle.parsed().deserialize(frame.payload()) {
                        Ok(value) => Payload::Decoded(value),
                        Err(err) => {
                            self.fallback(&raw, Some(id), "undecodable", &err);
                            Payload::Raw(raw.value.clone())
                        }
                    },
                    Err(err) => {
                        self.fallback(&raw, Some(id), "unresolved", &err);
                        Payload::Raw(raw.value.clone())
                    }
                };
                (payload, Some(id))
            }
        };

        Record::new(raw, payload, schema_id)
    }

    fn fallback(
        &self,
        raw: &RawRecord,
        schema_id: Option<u32>,
        reason: &str,
        err: &dyn std::error::Error,
    ) {
        tracing::warn!(
            topic = %raw.topic,
            partition = raw.partition,
            offset = raw.offset,
            schema_id,
            reason,
            error = %err,
            "Delivering record undecoded"
        );
        self.metrics.increment(
            metrics::DECODE_FALLBACKS,
            &[("topic", raw.topic.as_str()), ("reason", reason)],
        );
    }

    fn mark(&mut self, tp: &TopicPartition, offset: i64) {
        let next = offset + 1;
        let entry = self.pending.entry(tp.clone()).or_insert(next);
        *entry = (*entry).max(next);
    }

    async fn after_record(&mut self) -> Result<(), ClientError> {
        match self.config.commit_policy {
            CommitPolicy::AfterRecord => self.commit().await,
            CommitPolicy::Auto { .. } => {
                self.maybe_auto_commit().await;
                Ok(())
            }
            CommitPolicy::Manual => Ok(()),
        }
    }

    async fn maybe_auto_commit(&mut self) {
        let CommitPolicy::Auto { interval } = self.config.commit_policy else {
            return;
        };
        if self.pending.is_empty() || self.last_commit.elapsed() < interval {
            return;
        }
        if let Err(err) = self.commit().await {
            tracing::warn!(error = %err, "Auto commit failed");
            self.metrics.increment(metrics::ERRORS, &[("kind", "commit")]);
        }
    }
}
