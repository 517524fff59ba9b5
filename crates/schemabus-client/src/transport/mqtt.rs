//! MQTT transport via `rumqttc`.
//!
//! MQTT has no keys, headers or offsets, so each record travels as a CBOR
//! envelope carrying key, headers, timestamp and value. Payloads that are not
//! envelopes are delivered as bare values. Consumer groups map onto shared
//! subscriptions (`$share/<group>/<topic>`); every topic is a single
//! partition and offsets are a local per-topic sequence. Commits acknowledge
//! the held publishes back to the broker.

use super::{Publisher, Subscriber};
use crate::config::{parse_broker_list, Acks, ConsumerConfig, ProducerConfig, TransportKind};
use crate::error::{ClientError, TransportError};
use crate::record::{Delivery, Headers, OutboundRecord, RawRecord, TopicPartition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REQUEST_CAPACITY: usize = 100;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schemabus: u8,
    key: Vec<u8>,
    headers: Headers,
    timestamp_ms: i64,
    value: Vec<u8>,
}

fn encode_envelope(record: &OutboundRecord) -> Result<Vec<u8>, TransportError> {
    let envelope = Envelope {
        schemabus: ENVELOPE_VERSION,
        key: record.key.clone(),
        headers: record.headers.clone(),
        timestamp_ms: record.timestamp.timestamp_millis(),
        value: record.value.clone(),
    };
    let mut buf = Vec::new();
    ciborium::into_writer(&envelope, &mut buf)
        .map_err(|e| TransportError::Publish(format!("envelope encoding failed: {e}")))?;
    Ok(buf)
}

/// Split a received payload into `(key, headers, timestamp, value)`.
fn decode_envelope(payload: &[u8]) -> (Vec<u8>, Headers, DateTime<Utc>, Vec<u8>) {
    match ciborium::from_reader::<Envelope, _>(payload) {
        Ok(envelope) if envelope.schemabus == ENVELOPE_VERSION => (
            envelope.key,
            envelope.headers,
            DateTime::from_timestamp_millis(envelope.timestamp_ms).unwrap_or_else(Utc::now),
            envelope.value,
        ),
        _ => (Vec::new(), Headers::new(), Utc::now(), payload.to_vec()),
    }
}

fn qos_for(acks: Acks) -> QoS {
    match acks {
        Acks::None => QoS::AtMostOnce,
        Acks::Leader => QoS::AtLeastOnce,
        Acks::All => QoS::ExactlyOnce,
    }
}

fn mqtt_options(
    bootstrap_servers: &str,
    client_id: &str,
    manual_acks: bool,
) -> Result<MqttOptions, ClientError> {
    let brokers = parse_broker_list(bootstrap_servers, TransportKind::Mqtt)?;
    // MQTT clients connect to a single broker; the first entry wins
    let (host, port) = brokers
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::ConfigInvalid("bootstrap_servers is required".to_string()))?;

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_manual_acks(manual_acks);
    Ok(options)
}

async fn backoff(delay: &mut Duration, shutdown: &CancellationToken) -> bool {
    let sleep = *delay;
    *delay = (*delay * 2).min(BACKOFF_MAX);
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(sleep) => true,
    }
}

type AckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug, Default)]
struct AckState {
    /// Publishes handed to the client, waiting for a packet id
    queued: VecDeque<AckSender>,
    /// Publishes on the wire, waiting for PUBACK / PUBCOMP
    in_flight: HashMap<u16, AckSender>,
}

impl AckState {
    fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    fn fail_all(&mut self, err: &TransportError) {
        for tx in self.queued.drain(..).chain(self.in_flight.drain().map(|(_, tx)| tx)) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

fn lock(acks: &Mutex<AckState>) -> MutexGuard<'_, AckState> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT publisher. Each publish waits for the acknowledgement matching its QoS.
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    acks: Arc<Mutex<AckState>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MqttPublisher {
    /// Connect to the first broker in `config.bootstrap_servers`.
    ///
    /// Must be called inside a tokio runtime; the event loop runs on a
    /// spawned task until [`Publisher::close`].
    ///
    /// # Errors
    ///
    /// Returns error if the broker address is invalid.
    pub fn connect(config: &ProducerConfig) -> Result<Self, ClientError> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("schemabus-producer-{}", Uuid::new_v4()));
        let options = mqtt_options(&config.bootstrap_servers, &client_id, false)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let qos = qos_for(config.acks);
        let acks = Arc::new(Mutex::new(AckState::default()));
        let shutdown = CancellationToken::new();

        tokio::spawn(drive_publisher(
            eventloop,
            Arc::clone(&acks),
            qos,
            shutdown.clone(),
        ));

        tracing::info!(client_id, ?qos, "MQTT publisher started");

        Ok(Self {
            client,
            qos,
            acks,
            closed: AtomicBool::new(false),
            shutdown,
        })
    }
}

async fn drive_publisher(
    mut eventloop: EventLoop,
    acks: Arc<Mutex<AckState>>,
    qos: QoS,
    shutdown: CancellationToken,
) {
    let mut delay = BACKOFF_MIN;
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let mut state = lock(&acks);
                // retransmissions after a reconnect find no waiter
                if let Some(tx) = state.queued.pop_front() {
                    if qos == QoS::AtMostOnce {
                        let _ = tx.send(Ok(()));
                    } else {
                        state.in_flight.insert(pkid, tx);
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) if qos == QoS::AtLeastOnce => {
                if let Some(tx) = lock(&acks).in_flight.remove(&ack.pkid) {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                if let Some(tx) = lock(&acks).in_flight.remove(&comp.pkid) {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::debug!("MQTT publisher connected");
                delay = BACKOFF_MIN;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "MQTT publisher connection error");
                lock(&acks).fail_all(&TransportError::Connection(err.to_string()));
                if !backoff(&mut delay, &shutdown).await {
                    break;
                }
            }
        }
    }

    lock(&acks).fail_all(&TransportError::Closed);
    tracing::debug!("MQTT publisher event loop stopped");
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<Delivery, TransportError> {
        let payload = encode_envelope(&record)?;
        let rx = loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            {
                // queue order must match request order seen by the event loop
                let mut state = lock(&self.acks);
                if self
                    .client
                    .try_publish(record.topic.as_str(), self.qos, false, payload.clone())
                    .is_ok()
                {
                    state.queued.push_back(tx);
                    break rx;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        match rx.await {
            Ok(Ok(())) => Ok(Delivery {
                partition: 0,
                offset: -1,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = lock(&self.acks).pending();
            if remaining == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Unflushed { remaining });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()));
        self.shutdown.cancel();
        result
    }
}

/// MQTT subscriber joined to a shared-subscription group.
pub struct MqttSubscriber {
    client: AsyncClient,
    group: String,
    qos: QoS,
    topics: BTreeSet<String>,
    incoming: mpsc::Receiver<Result<Publish, TransportError>>,
    pending_error: Option<TransportError>,
    next_offset: HashMap<String, i64>,
    unacked: HashMap<String, VecDeque<(i64, Publish)>>,
    shutdown: CancellationToken,
    closed: bool,
}

impl MqttSubscriber {
    /// Connect to the first broker in `config.bootstrap_servers`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the broker address is invalid.
    pub fn connect(config: &ConsumerConfig) -> Result<Self, ClientError> {
        let client_id = format!("{}-{}", config.group_id, Uuid::new_v4());
        let options = mqtt_options(&config.bootstrap_servers, &client_id, true)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let (tx, incoming) = mpsc::channel(config.max_poll_records.max(1) * 2);
        let shutdown = CancellationToken::new();
        tokio::spawn(drive_subscriber(eventloop, tx, shutdown.clone()));

        tracing::info!(client_id, group_id = %config.group_id, "MQTT subscriber started");

        Ok(Self::new(client, &config.group_id, incoming, shutdown))
    }

    fn new(
        client: AsyncClient,
        group: &str,
        incoming: mpsc::Receiver<Result<Publish, TransportError>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            group: group.to_string(),
            qos: QoS::AtLeastOnce,
            topics: BTreeSet::new(),
            incoming,
            pending_error: None,
            next_offset: HashMap::new(),
            unacked: HashMap::new(),
            shutdown,
            closed: false,
        }
    }

    fn to_raw(&mut self, publish: Publish) -> RawRecord {
        let (key, headers, timestamp, value) = decode_envelope(&publish.payload);
        let next = self.next_offset.entry(publish.topic.clone()).or_insert(0);
        let offset = *next;
        *next += 1;

        let record = RawRecord {
            topic: publish.topic.clone(),
            partition: 0,
            offset,
            key,
            value,
            headers,
            timestamp,
        };
        self.unacked
            .entry(publish.topic.clone())
            .or_default()
            .push_back((offset, publish));
        record
    }
}

async fn drive_subscriber(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<Result<Publish, TransportError>>,
    shutdown: CancellationToken,
) {
    let mut delay = BACKOFF_MIN;
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Received MQTT publish"
                );
                if tx.send(Ok(publish)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::debug!("MQTT subscriber connected");
                delay = BACKOFF_MIN;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "MQTT subscriber connection error");
                let _ = tx.try_send(Err(TransportError::Connection(err.to_string())));
                if !backoff(&mut delay, &shutdown).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("MQTT subscriber event loop stopped");
}

#[async_trait]
impl Subscriber for MqttSubscriber {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        for topic in topics {
            if self.topics.contains(topic) {
                continue;
            }
            let filter = format!("$share/{}/{topic}", self.group);
            tracing::info!(topic, filter, "Subscribing to MQTT topic");
            self.client
                .subscribe(filter, self.qos)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            self.topics.insert(topic.clone());
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
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }

        let first = match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => return Err(TransportError::Closed),
            Ok(Some(Err(err))) => return Err(err),
            Ok(Some(Ok(publish))) => publish,
        };

        let mut batch = vec![self.to_raw(first)];
        while batch.len() < max_records {
            match self.incoming.try_recv() {
                Ok(Ok(publish)) => batch.push(self.to_raw(publish)),
                // the batch so far is returned; the error goes out on the next poll
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "Deferring MQTT error until next poll");
                    self.pending_error = Some(err);
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<(), TransportError> {
        for (tp, next) in offsets {
            let Some(held) = self.unacked.get_mut(&tp.topic) else {
                continue;
            };
            while held.front().is_some_and(|(offset, _)| offset < next) {
                if let Some((_, publish)) = held.pop_front() {
                    self.client
                        .ack(&publish)
                        .await
                        .map_err(|e| TransportError::Commit(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()));
        self.shutdown.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_key_headers_and_timestamp() {
        let record = OutboundRecord {
            topic: "sensors".to_string(),
            key: b"device-1".to_vec(),
            value: vec![0, 0, 0, 0, 7, 1, 2],
            headers: Headers::from([("trace".to_string(), "abc".to_string())]),
            timestamp: DateTime::from_timestamp_millis(1_704_067_200_123).unwrap(),
        };

        let bytes = encode_envelope(&record).unwrap();
        let (key, headers, timestamp, value) = decode_envelope(&bytes);
        assert_eq!(key, record.key);
        assert_eq!(headers, record.headers);
        assert_eq!(timestamp, record.timestamp);
        assert_eq!(value, record.value);
    }

    #[test]
    fn foreign_payload_is_a_bare_value() {
        let (key, headers, _, value) = decode_envelope(b"{\"temp\": 21}");
        assert!(key.is_empty());
        assert!(headers.is_empty());
        assert_eq!(value, b"{\"temp\": 21}");
    }

    #[test]
    fn acks_map_to_qos() {
        assert_eq!(qos_for(Acks::None), QoS::AtMostOnce);
        assert_eq!(qos_for(Acks::Leader), QoS::AtLeastOnce);
        assert_eq!(qos_for(Acks::All), QoS::ExactlyOnce);
    }

    #[test]
    fn options_use_first_broker() {
        let options = mqtt_options("tcp://mqtt-a:1884,mqtt-b", "client", false).unwrap();
        assert_eq!(options.broker_address(), ("mqtt-a".to_string(), 1884));
        assert!(mqtt_options("http://mqtt-a", "client", false).is_err());
    }

    #[tokio::test]
    async fn connection_error_behind_a_publish_reaches_the_next_poll() {
        let options = mqtt_options("tcp://localhost:1883", "unit", true).unwrap();
        let (client, _eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, incoming) = mpsc::channel(8);
        let mut subscriber = MqttSubscriber::new(client, "g", incoming, CancellationToken::new());

        tx.send(Ok(Publish::new("t", QoS::AtLeastOnce, b"a".to_vec())))
            .await
            .unwrap();
        tx.send(Err(TransportError::Connection("reset".to_string())))
            .await
            .unwrap();
        tx.send(Ok(Publish::new("t", QoS::AtLeastOnce, b"b".to_vec())))
            .await
            .unwrap();

        let wait = Duration::from_millis(100);
        let batch = subscriber.poll(10, wait).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"a");

        let err = subscriber.poll(10, wait).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(ref msg) if msg == "reset"));

        let batch = subscriber.poll(10, wait).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 1);
        assert_eq!(batch[0].value, b"b");
    }

    #[test]
    fn fail_all_drains_waiters() {
        let mut state = AckState::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        state.queued.push_back(tx1);
        state.in_flight.insert(3, tx2);
        assert_eq!(state.pending(), 2);

        state.fail_all(&TransportError::Closed);
        assert_eq!(state.pending(), 0);
        assert!(matches!(rx1.try_recv(), Ok(Err(TransportError::Closed))));
        assert!(matches!(rx2.try_recv(), Ok(Err(TransportError::Closed))));
    }
}
