//! Producer → broker → consumer round trips over the in-memory transport
//! and registry.

use schemabus_client::transport::memory::MemoryBroker;
use schemabus_client::{
    AutoOffsetReset, BoxError, CancellationToken, ClientError, CommitPolicy, Consumer,
    ConsumerConfig, ConsumerState, HandlerErrorPolicy, Headers, InMemoryMetrics, Payload, Producer,
    ProducerConfig, Record,
};
use schemabus_registry::{MemorySchemaRegistry, SchemaCache, SchemaFormat, SchemaRegistry};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PAYMENT_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Payment",
    "namespace": "bank",
    "fields": [
        {"name": "id", "type": "string"},
        {"name": "amount", "type": "long"},
        {"name": "currency", "type": "string"}
    ]
}"#;

const GROUP: &str = "payments-service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payment {
    id: String,
    amount: i64,
    currency: String,
}

fn payment(n: i64) -> Payment {
    Payment {
        id: format!("pay-{n}"),
        amount: n * 100,
        currency: "EUR".to_string(),
    }
}

struct Harness {
    broker: MemoryBroker,
    registry: Arc<MemorySchemaRegistry>,
}

impl Harness {
    fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            registry: Arc::new(MemorySchemaRegistry::new()),
        }
    }

    fn cache(&self) -> Arc<SchemaCache> {
        Arc::new(SchemaCache::new(
            Arc::clone(&self.registry) as Arc<dyn SchemaRegistry>
        ))
    }

    fn producer(&self) -> Producer {
        Producer::with_parts(
            ProducerConfig::new("memory:9092", "http://registry.test"),
            Arc::new(self.broker.publisher()),
            self.cache(),
        )
        .unwrap()
    }

    fn consumer_config(&self, topic: &str) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(
            "memory:9092",
            "http://registry.test",
            GROUP,
            vec![topic.to_string()],
        );
        config.poll_interval = Duration::from_millis(50);
        config
    }

    fn consumer(&self, config: ConsumerConfig) -> Consumer {
        Consumer::with_parts(
            config,
            Box::new(self.broker.subscriber(GROUP, AutoOffsetReset::Earliest)),
            self.cache(),
        )
        .unwrap()
    }
}

/// Handler that collects records and cancels once `stop_after` have arrived.
fn collector(
    seen: &Arc<Mutex<Vec<Record>>>,
    cancel: &CancellationToken,
    stop_after: usize,
) -> impl FnMut(Record) -> std::future::Ready<Result<(), BoxError>> + Send {
    let seen = Arc::clone(seen);
    let cancel = cancel.clone();
    move |record| {
        let mut guard = seen.lock().unwrap();
        guard.push(record);
        if guard.len() >= stop_after {
            cancel.cancel();
        }
        std::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn ten_records_arrive_decoded_and_in_order() {
    let harness = Harness::new();
    harness
        .registry
        .register_schema("payments-value", PAYMENT_SCHEMA, SchemaFormat::Avro)
        .await
        .unwrap();

    let producer = harness.producer();
    let sent: Vec<Payment> = (1..=10).map(payment).collect();
    for p in &sent {
        producer.produce("payments", b"account-1", p).await.unwrap();
    }

    let mut consumer = harness.consumer(harness.consumer_config("payments"));
    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        consumer.consume(&cancel, collector(&seen, &cancel, 10)),
    )
    .await
    .expect("consume loop did not stop");
    assert!(matches!(result, Err(ClientError::Cancelled)));

    let seen = seen.lock().unwrap();
    let received: Vec<Payment> = seen
        .iter()
        .map(|record| record.deserialize().unwrap().unwrap())
        .collect();
    assert_eq!(received, sent);

    let offsets: Vec<i64> = seen.iter().map(Record::offset).collect();
    assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    assert!(seen.iter().all(|r| r.key_str() == Some("account-1")));
    assert!(seen.iter().all(|r| r.schema_id() == seen[0].schema_id()));
}

#[tokio::test]
async fn cancellation_interrupts_an_idle_poll() {
    let harness = Harness::new();
    let mut config = harness.consumer_config("quiet");
    config.poll_interval = Duration::from_secs(30);
    let mut consumer = harness.consumer(config);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = consumer
        .consume(&cancel, |_record| async { Ok::<(), BoxError>(()) })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn schema_is_registered_once_for_repeated_produces() {
    let harness = Harness::new();
    let producer = harness.producer();

    for n in 0..5 {
        producer
            .produce_with_schema("payments", b"", &payment(n), PAYMENT_SCHEMA)
            .await
            .unwrap();
    }

    assert_eq!(harness.registry.register_calls(), 1);
    let latest = harness.registry.latest_schema("payments-value").await.unwrap();
    assert_eq!(latest.version, Some(1));
}

#[tokio::test]
async fn schema_less_traffic_coexists_with_framed_records() {
    let harness = Harness::new();
    let producer = harness.producer();

    producer
        .produce_with_schema("mixed", b"", &payment(1), PAYMENT_SCHEMA)
        .await
        .unwrap();
    producer
        .produce_raw("mixed", b"", b"legacy,csv,line", Headers::new())
        .await
        .unwrap();
    producer
        .produce_raw("mixed", b"", &[0, 0, 0, 0x7f, 0x7f, 1], Headers::new())
        .await
        .unwrap();

    let mut consumer = harness.consumer(harness.consumer_config("mixed"));
    let first = consumer.consume_once(Duration::from_secs(1)).await.unwrap();
    let second = consumer.consume_once(Duration::from_secs(1)).await.unwrap();
    let third = consumer.consume_once(Duration::from_secs(1)).await.unwrap();

    assert_eq!(first.deserialize::<Payment>().unwrap().unwrap(), payment(1));
    assert_eq!(second.value(), &Payload::Raw(b"legacy,csv,line".to_vec()));
    assert_eq!(second.schema_id(), None);
    assert!(!third.value().is_decoded());
    assert_eq!(third.schema_id(), Some(0x7f7f));
}

#[tokio::test]
async fn headers_survive_the_round_trip() {
    let harness = Harness::new();
    harness
        .registry
        .register_schema("audit-value", PAYMENT_SCHEMA, SchemaFormat::Avro)
        .await
        .unwrap();
    let producer = harness.producer();

    let headers = Headers::from([("correlation-id".to_string(), "c-9".to_string())]);
    producer
        .produce_with_headers("audit", b"k", &payment(9), headers.clone())
        .await
        .unwrap();

    let mut consumer = harness.consumer(harness.consumer_config("audit"));
    let record = consumer.consume_once(Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.headers(), &headers);
}

async fn publish_three(harness: &Harness, topic: &str) {
    let producer = harness.producer();
    for n in 1..=3 {
        producer
            .produce_with_schema(topic, b"", &payment(n), PAYMENT_SCHEMA)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn fail_fast_stops_without_marking_the_failed_record() {
    let harness = Harness::new();
    publish_three(&harness, "ff").await;

    let mut config = harness.consumer_config("ff");
    config.handler_error_policy = HandlerErrorPolicy::FailFast;
    config.commit_policy = CommitPolicy::AfterRecord;
    let mut consumer = harness.consumer(config);

    let cancel = CancellationToken::new();
    let err = consumer
        .consume(&cancel, |record: Record| async move {
            let p: Payment = record.deserialize().unwrap()?;
            if p.id == "pay-2" {
                return Err::<(), BoxError>("insufficient funds".into());
            }
            Ok(())
        })
        .await
        .unwrap_err();

    match err {
        ClientError::Handler {
            topic,
            partition,
            offset,
            source,
        } => {
            assert_eq!(topic, "ff");
            assert_eq!(partition, 0);
            assert_eq!(offset, 1);
            assert_eq!(source.to_string(), "insufficient funds");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.broker.committed(GROUP, "ff", 0), Some(1));
}

#[tokio::test]
async fn fail_fast_halts_until_reopened_and_redelivers_the_failed_record() {
    let harness = Harness::new();
    publish_three(&harness, "halt").await;

    let mut config = harness.consumer_config("halt");
    config.handler_error_policy = HandlerErrorPolicy::FailFast;
    config.commit_policy = CommitPolicy::AfterRecord;
    let mut consumer = harness.consumer(config.clone());

    let cancel = CancellationToken::new();
    let err = consumer
        .consume(&cancel, |record: Record| async move {
            let p: Payment = record.deserialize().unwrap()?;
            if p.id == "pay-2" {
                return Err::<(), BoxError>("rejected".into());
            }
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "handler");
    assert_eq!(consumer.state(), ConsumerState::Failed);

    // "pay-3" is still in the fetched batch; it must not be handed out.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let err = consumer
        .consume(&cancel, collector(&seen, &cancel, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Halted { offset: 1, .. }));
    assert!(seen.lock().unwrap().is_empty());
    assert!(matches!(
        consumer.consume_once(Duration::from_millis(50)).await,
        Err(ClientError::Halted { .. })
    ));
    assert_eq!(harness.broker.committed(GROUP, "halt", 0), Some(1));

    consumer.close().await.unwrap();
    assert_eq!(harness.broker.committed(GROUP, "halt", 0), Some(1));

    let mut reopened = harness.consumer(config);
    let record = reopened.consume_once(Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.offset(), 1);
    assert_eq!(record.deserialize::<Payment>().unwrap().unwrap(), payment(2));
}

#[tokio::test]
async fn log_and_continue_marks_failed_records_and_keeps_going() {
    let harness = Harness::new();
    publish_three(&harness, "lac").await;

    let mut config = harness.consumer_config("lac");
    config.handler_error_policy = HandlerErrorPolicy::LogAndContinue;
    config.commit_policy = CommitPolicy::AfterRecord;
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut consumer = harness
        .consumer(config)
        .with_metrics(Arc::clone(&metrics) as Arc<dyn schemabus_client::MetricsSink>);

    let cancel = CancellationToken::new();
    let handled = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&handled);
    let stop = cancel.clone();
    let err = consumer
        .consume(&cancel, move |record: Record| {
            let counter = Arc::clone(&counter);
            let stop = stop.clone();
            async move {
                let total = {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    *n
                };
                if total == 3 {
                    stop.cancel();
                }
                if record.offset() == 0 {
                    return Err::<(), BoxError>("transient".into());
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(*handled.lock().unwrap(), 3);
    assert_eq!(harness.broker.committed(GROUP, "lac", 0), Some(3));
    assert_eq!(
        metrics.counter(
            "schemabus_errors_total",
            &[("topic", "lac"), ("kind", "handler")]
        ),
        1
    );
    assert_eq!(
        metrics.counter("schemabus_messages_consumed_total", &[("topic", "lac")]),
        2
    );
}

#[tokio::test]
async fn auto_commit_flushes_on_close_and_a_new_member_resumes() {
    let harness = Harness::new();
    publish_three(&harness, "auto").await;

    let mut config = harness.consumer_config("auto");
    config.commit_policy = CommitPolicy::Auto {
        interval: Duration::from_secs(3600),
    };
    let mut consumer = harness.consumer(config.clone());

    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let result = consumer.consume(&cancel, collector(&seen, &cancel, 2)).await;
    assert!(matches!(result, Err(ClientError::Cancelled)));

    assert_eq!(harness.broker.committed(GROUP, "auto", 0), None);
    consumer.close().await.unwrap();
    assert_eq!(harness.broker.committed(GROUP, "auto", 0), Some(2));

    let mut next = harness.consumer(config);
    let record = next.consume_once(Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.offset(), 2);
    assert_eq!(record.deserialize::<Payment>().unwrap().unwrap(), payment(3));
}

#[tokio::test]
async fn manual_policy_never_commits_on_its_own() {
    let harness = Harness::new();
    publish_three(&harness, "manual").await;

    let mut config = harness.consumer_config("manual");
    config.commit_policy = CommitPolicy::Manual;
    let mut consumer = harness.consumer(config);

    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _ = consumer.consume(&cancel, collector(&seen, &cancel, 3)).await;
    consumer.close().await.unwrap();

    assert_eq!(harness.broker.committed(GROUP, "manual", 0), None);
}

#[tokio::test]
async fn producer_and_consumer_metrics() {
    let harness = Harness::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let producer = harness
        .producer()
        .with_metrics(Arc::clone(&metrics) as Arc<dyn schemabus_client::MetricsSink>);

    producer
        .produce_with_schema("m", b"", &payment(1), PAYMENT_SCHEMA)
        .await
        .unwrap();
    let err = producer
        .produce("unregistered", b"", &payment(2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "schema");

    assert_eq!(
        metrics.counter("schemabus_messages_produced_total", &[("topic", "m")]),
        1
    );
    assert_eq!(
        metrics.counter(
            "schemabus_errors_total",
            &[("topic", "unregistered"), ("kind", "schema")]
        ),
        1
    );
    assert!(metrics
        .render_prometheus()
        .contains("schemabus_produce_duration_seconds_count{topic=\"m\"} 1"));
}
