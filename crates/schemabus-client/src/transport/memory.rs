//! In-process partitioned log with consumer groups.
//!
//! Behaves like a single-node broker: keyed records hash to a partition,
//! unkeyed records are spread round robin, each partition is an append-only
//! log, and committed positions are stored per `(group, topic, partition)`.
//! Used by the end-to-end tests and by the CLI's `demo` command.

use super::{Publisher, Subscriber};
use crate::config::AutoOffsetReset;
use crate::error::TransportError;
use crate::record::{Delivery, Headers, OutboundRecord, RawRecord, TopicPartition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Headers,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, TopicPartition), i64>,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

#[derive(Debug)]
struct Inner {
    partitions: usize,
    state: Mutex<BrokerState>,
    appended: watch::Sender<u64>,
    round_robin: AtomicU64,
    poll_failures: AtomicUsize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-memory broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker whose topics have a single partition.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker whose topics have `partitions` partitions (at least one).
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                appended,
                round_robin: AtomicU64::new(0),
                poll_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// A publisher writing to this broker.
    #[must_use]
    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// A subscriber reading as member of `group`.
    #[must_use]
    pub fn subscriber(&self, group: impl Into<String>, reset: AutoOffsetReset) -> MemorySubscriber {
        MemorySubscriber {
            broker: self.clone(),
            group: group.into(),
            reset,
            topics: BTreeSet::new(),
            positions: HashMap::new(),
            appended: self.inner.appended.subscribe(),
            closed: false,
        }
    }

    /// Committed next offset of `group` on a partition.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state()
            .committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    /// Offset the next record appended to a partition will receive.
    #[must_use]
    pub fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        let state = self.inner.state();
        usize::try_from(partition)
            .ok()
            .and_then(|p| state.topics.get(topic)?.get(p).map(Vec::len))
            .map_or(0, len_to_offset)
    }

    /// Make the next `count` polls on any subscriber fail with a retriable
    /// [`TransportError::Poll`].
    pub fn inject_poll_failures(&self, count: usize) {
        self.inner.poll_failures.store(count, Ordering::SeqCst);
    }

    fn partition_for(&self, key: &[u8]) -> usize {
        let partitions = self.inner.partitions as u64;
        let slot = if key.is_empty() {
            self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % partitions
        } else {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish() % partitions
        };
        // bounded by `partitions`, which came from a usize
        usize::try_from(slot).unwrap_or(0)
    }

    fn append(&self, record: OutboundRecord) -> Delivery {
        let partition = self.partition_for(&record.key);
        let offset = {
            let mut state = self.inner.state();
            let log = &mut state.topic_mut(&record.topic, self.inner.partitions)[partition];
            log.push(StoredRecord {
                key: record.key,
                value: record.value,
                headers: record.headers,
                timestamp: record.timestamp,
            });
            len_to_offset(log.len()) - 1
        };
        self.inner.appended.send_modify(|version| *version += 1);

        Delivery {
            partition: i32::try_from(partition).unwrap_or(i32::MAX),
            offset,
        }
    }

    fn take_poll_failure(&self) -> bool {
        self.inner
            .poll_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn len_to_offset(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

/// Publisher half of [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<Delivery, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.broker.append(record))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), TransportError> {
        // appends are acknowledged synchronously
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Subscriber half of [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySubscriber {
    broker: MemoryBroker,
    group: String,
    reset: AutoOffsetReset,
    topics: BTreeSet<String>,
    positions: HashMap<TopicPartition, i64>,
    appended: watch::Receiver<u64>,
    closed: bool,
}

impl MemorySubscriber {
    fn collect(&self, max_records: usize) -> Vec<RawRecord> {
        let state = self.broker.inner.state();
        let mut batch = Vec::new();

        for topic in &self.topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (index, log) in partitions.iter().enumerate() {
                let tp = TopicPartition::new(topic.clone(), i32::try_from(index).unwrap_or(i32::MAX));
                let start = self.positions.get(&tp).copied().unwrap_or(0);
                let start = usize::try_from(start).unwrap_or(usize::MAX);

                for (offset, stored) in log.iter().enumerate().skip(start) {
                    if batch.len() >= max_records {
                        return batch;
                    }
                    batch.push(RawRecord {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        offset: len_to_offset(offset),
                        key: stored.key.clone(),
                        value: stored.value.clone(),
                        headers: stored.headers.clone(),
                        timestamp: stored.timestamp,
                    });
                }
            }
        }

        batch
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let partitions = self.broker.inner.partitions;
        let mut state = self.broker.inner.state();
        for topic in topics {
            if !self.topics.insert(topic.clone()) {
                continue;
            }
            let ends: Vec<i64> = state
                .topic_mut(topic, partitions)
                .iter()
                .map(|log| len_to_offset(log.len()))
                .collect();

            for (index, end) in ends.into_iter().enumerate() {
                let tp = TopicPartition::new(topic.clone(), i32::try_from(index).unwrap_or(i32::MAX));
                let start = match state.committed.get(&(self.group.clone(), tp.clone())) {
                    Some(committed) => *committed,
                    None => match self.reset {
                        AutoOffsetReset::Earliest => 0,
                        AutoOffsetReset::Latest => end,
                    },
                };
                self.positions.insert(tp, start);
            }
        }

        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.broker.take_poll_failure() {
            return Err(TransportError::Poll("injected poll failure".to_string()));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.appended.borrow_and_update();
            let batch = self.collect(max_records);
            if !batch.is_empty() {
                for record in &batch {
                    self.positions
                        .insert(record.topic_partition(), record.offset + 1);
                }
                return Ok(batch);
            }

            match tokio::time::timeout_at(deadline, self.appended.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.broker.inner.state();
        for (tp, offset) in offsets {
            state
                .committed
                .insert((self.group.clone(), tp.clone()), *offset);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, key: &str, value: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            headers: Headers::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn offsets_are_sequential_per_partition() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();

        let first = publisher.publish(record("t", "k", "a")).await.unwrap();
        let second = publisher.publish(record("t", "k", "b")).await.unwrap();
        assert_eq!((first.partition, first.offset), (0, 0));
        assert_eq!((second.partition, second.offset), (0, 1));
        assert_eq!(broker.end_offset("t", 0), 2);
    }

    #[tokio::test]
    async fn same_key_same_partition() {
        let broker = MemoryBroker::with_partitions(4);
        let publisher = broker.publisher();

        let a = publisher.publish(record("t", "order-7", "1")).await.unwrap();
        let b = publisher.publish(record("t", "order-7", "2")).await.unwrap();
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn earliest_reads_history_latest_does_not() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        publisher.publish(record("t", "", "old")).await.unwrap();

        let mut earliest = broker.subscriber("g1", AutoOffsetReset::Earliest);
        earliest.subscribe(&["t".to_string()]).await.unwrap();
        let mut latest = broker.subscriber("g2", AutoOffsetReset::Latest);
        latest.subscribe(&["t".to_string()]).await.unwrap();

        let batch = earliest.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"old");

        let batch = latest.poll(10, Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());

        publisher.publish(record("t", "", "new")).await.unwrap();
        let batch = latest.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"new");
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut subscriber = broker.subscriber("g", AutoOffsetReset::Earliest);
        subscriber.subscribe(&["t".to_string()]).await.unwrap();

        let publisher = broker.publisher();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(record("t", "", "late")).await.unwrap();
        });

        let batch = subscriber.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn committed_offsets_resume_the_group() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        for value in ["a", "b", "c"] {
            publisher.publish(record("t", "", value)).await.unwrap();
        }

        let mut first = broker.subscriber("g", AutoOffsetReset::Earliest);
        first.subscribe(&["t".to_string()]).await.unwrap();
        let batch = first.poll(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        first
            .commit(&[(TopicPartition::new("t", 0), 2)])
            .await
            .unwrap();
        assert_eq!(broker.committed("g", "t", 0), Some(2));

        let mut second = broker.subscriber("g", AutoOffsetReset::Earliest);
        second.subscribe(&["t".to_string()]).await.unwrap();
        let batch = second.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"c");
        assert_eq!(batch[0].offset, 2);
    }

    #[tokio::test]
    async fn injected_failures_are_retriable() {
        let broker = MemoryBroker::new();
        let mut subscriber = broker.subscriber("g", AutoOffsetReset::Earliest);
        subscriber.subscribe(&["t".to_string()]).await.unwrap();
        broker.inject_poll_failures(1);

        let err = subscriber.poll(1, Duration::from_millis(1)).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(subscriber.poll(1, Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn closed_publisher_rejects() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        publisher.close().await.unwrap();
        let err = publisher.publish(record("t", "", "x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
