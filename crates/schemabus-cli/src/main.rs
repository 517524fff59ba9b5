//! # schemabus CLI
//!
//! Command-line utilities for inspecting frames and moving schema-encoded
//! records through a broker.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use schemabus_client::transport::memory::MemoryBroker;
use schemabus_client::{
    AutoOffsetReset, BoxError, CancellationToken, ClientError, Consumer, ConsumerConfig,
    InMemoryMetrics, MetricsSink, Payload, Producer, ProducerConfig, Record,
};
use schemabus_registry::{MemorySchemaRegistry, SchemaCache};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::CliConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "encode" => {
            if args.len() < 4 {
                eprintln!("Usage: schemabus encode <schema-id> <payload>");
                std::process::exit(1);
            }
            let schema_id: u32 = args[2].parse().context("Invalid schema id")?;
            let frame = schemabus_wire::encode(schema_id, args[3].as_bytes());
            println!("{}", STANDARD.encode(frame));
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: schemabus decode <base64-frame>");
                std::process::exit(1);
            }
            let bytes = STANDARD.decode(args[2].trim()).context("Invalid base64")?;
            let (schema_id, payload) =
                schemabus_wire::decode(&bytes).context("Failed to decode frame")?;
            println!("schema_id: {schema_id}");
            match std::str::from_utf8(payload) {
                Ok(text) => println!("payload: {text}"),
                Err(_) => println!("payload (base64): {}", STANDARD.encode(payload)),
            }
        }
        "produce" => {
            if args.len() < 4 {
                eprintln!("Usage: schemabus produce <topic> <json-value> [schema-file]");
                std::process::exit(1);
            }
            let config = CliConfig::from_env()?;
            produce(&config, &args[2], &args[3], args.get(4).map(String::as_str)).await?;
        }
        "consume" => {
            let max = match args.get(2) {
                Some(max) => Some(max.parse::<usize>().context("Invalid record count")?),
                None => None,
            };
            let config = CliConfig::from_env()?;
            consume(&config, max).await?;
        }
        "demo" => {
            demo().await?;
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn produce(config: &CliConfig, topic: &str, value: &str, schema_file: Option<&str>) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(value).context("Value is not JSON")?;
    let producer = Producer::connect(config.producer_config())
        .await
        .context("Failed to create producer")?;

    let delivery = match schema_file {
        Some(path) => {
            let schema = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema file {path}"))?;
            producer
                .produce_with_schema(topic, b"", &value, &schema)
                .await
        }
        None => producer.produce(topic, b"", &value).await,
    }
    .context("Produce failed")?;

    println!(
        "delivered to {topic}[{}] at offset {}",
        delivery.partition, delivery.offset
    );
    producer.close().await.context("Failed to close producer")?;
    Ok(())
}

async fn consume(config: &CliConfig, max: Option<usize>) -> Result<()> {
    if config.topics.is_empty() {
        bail!("KAFKA_TOPICS must name at least one topic");
    }
    let mut consumer = Consumer::connect(config.consumer_config())
        .await
        .context("Failed to create consumer")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            on_signal.cancel();
        }
    });

    let mut printed = 0usize;
    let stop = cancel.clone();
    let result = consumer
        .consume(&cancel, |record| {
            print_record(&record);
            printed += 1;
            if max.is_some_and(|max| printed >= max) {
                stop.cancel();
            }
            std::future::ready(Ok::<(), BoxError>(()))
        })
        .await;

    consumer.close().await.context("Failed to close consumer")?;
    match result {
        Ok(()) | Err(ClientError::Cancelled) => Ok(()),
        Err(err) => Err(err).context("Consume loop failed"),
    }
}

fn print_record(record: &Record) {
    let value = match record.value() {
        Payload::Decoded(value) => value.clone(),
        Payload::Raw(bytes) => serde_json::json!({ "raw_base64": STANDARD.encode(bytes) }),
    };
    let line = serde_json::json!({
        "topic": record.topic(),
        "partition": record.partition(),
        "offset": record.offset(),
        "key": record.key_str(),
        "schema_id": record.schema_id(),
        "headers": record.headers(),
        "timestamp": record.timestamp().to_rfc3339(),
        "value": value,
    });
    println!("{line}");
}

const DEMO_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Greeting",
    "namespace": "schemabus.demo",
    "fields": [
        {"name": "seq", "type": "long"},
        {"name": "text", "type": "string"}
    ]
}"#;

/// Round trip through the in-memory broker and registry; no services needed.
async fn demo() -> Result<()> {
    const TOPIC: &str = "greetings";
    const COUNT: usize = 5;

    let broker = MemoryBroker::new();
    let cache = Arc::new(SchemaCache::new(Arc::new(MemorySchemaRegistry::new())));
    let metrics = Arc::new(InMemoryMetrics::new());

    let producer = Producer::with_parts(
        ProducerConfig::new("memory:9092", "http://registry.local"),
        Arc::new(broker.publisher()),
        Arc::clone(&cache),
    )?
    .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);

    for seq in 0..COUNT {
        let value = serde_json::json!({"seq": seq, "text": format!("hello #{seq}")});
        producer
            .produce_with_schema(TOPIC, b"demo", &value, DEMO_SCHEMA)
            .await?;
    }
    producer.close().await?;

    let mut consumer = Consumer::with_parts(
        ConsumerConfig::new(
            "memory:9092",
            "http://registry.local",
            "demo",
            vec![TOPIC.to_string()],
        ),
        Box::new(broker.subscriber("demo", AutoOffsetReset::Earliest)),
        cache,
    )?
    .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);

    for _ in 0..COUNT {
        let record = consumer.consume_once(Duration::from_secs(1)).await?;
        print_record(&record);
    }
    consumer.close().await?;

    eprint!("{}", metrics.render_prometheus());
    Ok(())
}

fn print_help() {
    println!(
        r#"schemabus CLI

USAGE:
    schemabus <COMMAND> [OPTIONS]

COMMANDS:
    encode <id> <payload>            Frame a payload with a schema id (base64 output)
    decode <base64-frame>            Split a base64 frame into schema id and payload
    produce <topic> <json> [schema]  Produce one value (registers [schema] if given)
    consume [count]                  Print records from KAFKA_TOPICS as JSON lines
    demo                             Round trip through the in-memory broker
    help                             Show this help message

ENVIRONMENT:
    SCHEMABUS_TRANSPORT, KAFKA_BOOTSTRAP_SERVERS, SCHEMA_REGISTRY_URL,
    SCHEMA_REGISTRY_TOKEN, KAFKA_GROUP_ID, KAFKA_TOPICS, KAFKA_AUTO_OFFSET_RESET,
    KAFKA_ACKS, KAFKA_COMPRESSION, SCHEMABUS_HANDLER_ERROR_POLICY, SCHEMABUS_USE_JSON

EXAMPLES:
    schemabus encode 1 hello
    schemabus decode AAAAAAFoZWxsbw==
    KAFKA_TOPICS=orders schemabus consume 10
"#
    );
}
