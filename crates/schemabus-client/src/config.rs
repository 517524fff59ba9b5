//! Producer and consumer configuration.
//!
//! Configs are plain values. [`ProducerConfig::validate`] and
//! [`ConsumerConfig::validate`] run once when a client is constructed;
//! construction fails fast on an invalid config.

use crate::error::ClientError;
use schemabus_registry::{RegistryAuth, RegistryClientConfig, SchemaFormat};
use schemabus_wire::SubjectNameStrategy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Which transport backend a client connects through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Kafka via librdkafka (requires the `kafka` feature)
    #[default]
    Kafka,
    /// MQTT broker
    Mqtt,
}

impl FromStr for TransportKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(ClientError::ConfigInvalid(format!(
                "unknown transport '{other}'"
            ))),
        }
    }
}

/// Replica acknowledgement required before a publish succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget
    None,
    /// Partition leader only
    Leader,
    /// All in-sync replicas
    #[default]
    All,
}

impl Acks {
    /// Kafka `acks` setting.
    #[must_use]
    pub fn as_kafka_str(self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

impl FromStr for Acks {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Self::None),
            "1" | "leader" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            other => Err(ClientError::ConfigInvalid(format!("unknown acks '{other}'"))),
        }
    }
}

/// Batch compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression
    None,
    /// Snappy
    #[default]
    Snappy,
    /// Gzip
    Gzip,
    /// LZ4
    Lz4,
    /// Zstandard
    Zstd,
}

impl Compression {
    /// Kafka `compression.type` setting.
    #[must_use]
    pub fn as_kafka_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Snappy => "snappy",
            Self::Gzip => "gzip",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "snappy" => Ok(Self::Snappy),
            "gzip" => Ok(Self::Gzip),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(ClientError::ConfigInvalid(format!(
                "unknown compression '{other}'"
            ))),
        }
    }
}

/// How record values are serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    /// Registry schema + framed payload
    #[default]
    Schema,
    /// Plain unframed JSON, no registry round trips
    Json,
}

/// Where a consumer group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    /// Oldest retained record
    #[default]
    Earliest,
    /// Only records published after subscription
    Latest,
}

impl FromStr for AutoOffsetReset {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(ClientError::ConfigInvalid(format!(
                "unknown auto offset reset '{other}'"
            ))),
        }
    }
}

/// When consumed offsets are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Periodically from the consume loop; failures are logged, not returned
    Auto {
        /// Minimum time between commits
        interval: Duration,
    },
    /// Synchronously after every successfully handled record
    AfterRecord,
    /// Only when [`Consumer::commit`](crate::Consumer::commit) is called
    Manual,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self::Auto {
            interval: Duration::from_secs(5),
        }
    }
}

/// What the consume loop does when a handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Stop the loop and return the handler error; the record stays uncommitted
    #[default]
    FailFast,
    /// Log, count, mark the record handled and keep going
    LogAndContinue,
}

impl FromStr for HandlerErrorPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "log_and_continue" => Ok(Self::LogAndContinue),
            other => Err(ClientError::ConfigInvalid(format!(
                "unknown handler error policy '{other}'"
            ))),
        }
    }
}

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Transport backend
    pub transport: TransportKind,
    /// Comma-separated `host:port` broker list
    pub bootstrap_servers: String,
    /// Schema registry base URL
    pub schema_registry_url: String,
    /// Optional registry credentials
    pub registry_auth: Option<RegistryAuth>,
    /// Registry request timeout
    pub registry_timeout: Duration,
    /// Client id reported to the broker; generated when absent
    pub client_id: Option<String>,
    /// Acknowledgement level
    pub acks: Acks,
    /// Idempotent send (requires [`Acks::All`])
    pub enable_idempotence: bool,
    /// Maximum unacknowledged requests per connection
    pub max_in_flight: u32,
    /// Time to wait for more records before sending a batch
    pub linger: Duration,
    /// Maximum batch size in bytes
    pub batch_max_bytes: u32,
    /// Batch compression
    pub compression: Compression,
    /// Upper bound on a single synchronous publish
    pub message_timeout: Duration,
    /// Flush bound used by [`Producer::close`](crate::Producer::close)
    pub close_timeout: Duration,
    /// Value serialization
    pub serialization: SerializationMode,
    /// Format of schemas passed to `produce_with_schema`
    pub schema_format: SchemaFormat,
    /// Topic → subject mapping
    pub subject_strategy: SubjectNameStrategy,
}

impl ProducerConfig {
    /// Defaults for the given brokers and registry: all-replica acks,
    /// idempotence on, 5 in flight, 5 ms linger, 16 KiB batches, snappy.
    #[must_use]
    pub fn new(bootstrap_servers: impl Into<String>, schema_registry_url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::default(),
            bootstrap_servers: bootstrap_servers.into(),
            schema_registry_url: schema_registry_url.into(),
            registry_auth: None,
            registry_timeout: Duration::from_secs(30),
            client_id: None,
            acks: Acks::All,
            enable_idempotence: true,
            max_in_flight: 5,
            linger: Duration::from_millis(5),
            batch_max_bytes: 16_384,
            compression: Compression::Snappy,
            message_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(10),
            serialization: SerializationMode::Schema,
            schema_format: SchemaFormat::Avro,
            subject_strategy: SubjectNameStrategy::TopicName,
        }
    }

    /// Check required fields and knob combinations.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ClientError> {
        parse_broker_list(&self.bootstrap_servers, self.transport)?;
        validate_registry_url(&self.schema_registry_url)?;

        if self.enable_idempotence && self.acks != Acks::All {
            return Err(ClientError::ConfigInvalid(
                "enable_idempotence requires acks=all".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ClientError::ConfigInvalid(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.batch_max_bytes == 0 {
            return Err(ClientError::ConfigInvalid(
                "batch_max_bytes must be at least 1".to_string(),
            ));
        }
        if self.message_timeout.is_zero() {
            return Err(ClientError::ConfigInvalid(
                "message_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Registry client settings derived from this config.
    #[must_use]
    pub fn registry_client_config(&self) -> RegistryClientConfig {
        RegistryClientConfig {
            base_url: self.schema_registry_url.clone(),
            timeout: self.registry_timeout,
            auth: self.registry_auth.clone(),
            ca_cert_path: None,
        }
    }
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Transport backend
    pub transport: TransportKind,
    /// Comma-separated `host:port` broker list
    pub bootstrap_servers: String,
    /// Schema registry base URL
    pub schema_registry_url: String,
    /// Optional registry credentials
    pub registry_auth: Option<RegistryAuth>,
    /// Registry request timeout
    pub registry_timeout: Duration,
    /// Consumer group id
    pub group_id: String,
    /// Topics subscribed on first poll
    pub topics: Vec<String>,
    /// Start position without committed offsets
    pub auto_offset_reset: AutoOffsetReset,
    /// Commit timing
    pub commit_policy: CommitPolicy,
    /// Handler failure behaviour
    pub handler_error_policy: HandlerErrorPolicy,
    /// Upper bound on records returned by one poll
    pub max_poll_records: usize,
    /// How long one poll waits for records
    pub poll_interval: Duration,
    /// Consecutive retriable poll failures tolerated before giving up
    pub max_poll_retries: u32,
    /// How unframed values are interpreted
    pub serialization: SerializationMode,
}

impl ConsumerConfig {
    /// Defaults: earliest offsets, 5 s auto-commit, fail-fast handlers,
    /// 500-record polls every 100 ms, 5 poll retries.
    #[must_use]
    pub fn new(
        bootstrap_servers: impl Into<String>,
        schema_registry_url: impl Into<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            transport: TransportKind::default(),
            bootstrap_servers: bootstrap_servers.into(),
            schema_registry_url: schema_registry_url.into(),
            registry_auth: None,
            registry_timeout: Duration::from_secs(30),
            group_id: group_id.into(),
            topics,
            auto_offset_reset: AutoOffsetReset::Earliest,
            commit_policy: CommitPolicy::default(),
            handler_error_policy: HandlerErrorPolicy::FailFast,
            max_poll_records: 500,
            poll_interval: Duration::from_millis(100),
            max_poll_retries: 5,
            serialization: SerializationMode::Schema,
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ClientError> {
        parse_broker_list(&self.bootstrap_servers, self.transport)?;
        validate_registry_url(&self.schema_registry_url)?;

        if self.group_id.trim().is_empty() {
            return Err(ClientError::ConfigInvalid("group_id is required".to_string()));
        }
        if self.topics.is_empty() {
            return Err(ClientError::ConfigInvalid(
                "at least one topic is required".to_string(),
            ));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ClientError::ConfigInvalid(
                "topic names must not be empty".to_string(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(ClientError::ConfigInvalid(
                "max_poll_records must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ClientError::ConfigInvalid(
                "poll_interval must be positive".to_string(),
            ));
        }
        if let CommitPolicy::Auto { interval } = self.commit_policy {
            if interval.is_zero() {
                return Err(ClientError::ConfigInvalid(
                    "auto commit interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Registry client settings derived from this config.
    #[must_use]
    pub fn registry_client_config(&self) -> RegistryClientConfig {
        RegistryClientConfig {
            base_url: self.schema_registry_url.clone(),
            timeout: self.registry_timeout,
            auth: self.registry_auth.clone(),
            ca_cert_path: None,
        }
    }
}

fn validate_registry_url(input: &str) -> Result<(), ClientError> {
    if input.trim().is_empty() {
        return Err(ClientError::ConfigInvalid(
            "schema_registry_url is required".to_string(),
        ));
    }
    let url = Url::parse(input)
        .map_err(|e| ClientError::ConfigInvalid(format!("schema_registry_url {input}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ClientError::ConfigInvalid(format!(
            "schema_registry_url {input}: unsupported scheme '{scheme}'"
        ))),
    }
}

/// Parse a comma-separated broker list into `(host, port)` pairs.
///
/// MQTT entries may carry a `tcp://` or `mqtt://` scheme and default to port
/// 1883; Kafka entries default to 9092.
///
/// # Errors
///
/// Returns [`ClientError::ConfigInvalid`] if the list is empty or an entry
/// cannot be parsed.
pub fn parse_broker_list(
    input: &str,
    transport: TransportKind,
) -> Result<Vec<(String, u16)>, ClientError> {
    let default_port = match transport {
        TransportKind::Kafka => 9092,
        TransportKind::Mqtt => 1883,
    };

    let brokers = input
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_broker(entry, transport, default_port))
        .collect::<Result<Vec<_>, _>>()?;

    if brokers.is_empty() {
        return Err(ClientError::ConfigInvalid(
            "bootstrap_servers is required".to_string(),
        ));
    }
    Ok(brokers)
}

fn parse_broker(
    input: &str,
    transport: TransportKind,
    default_port: u16,
) -> Result<(String, u16), ClientError> {
    let invalid = |reason: &str| ClientError::ConfigInvalid(format!("broker {input}: {reason}"));

    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;

        match (transport, url.scheme()) {
            (TransportKind::Mqtt, "tcp" | "mqtt") => {}
            (_, scheme) => return Err(invalid(&format!("unsupported scheme '{scheme}'"))),
        }

        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        return Ok((host.to_string(), url.port().unwrap_or(default_port)));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| invalid("missing host"))?;
    let port = match parts.next() {
        None => default_port,
        Some(port) => port
            .parse()
            .map_err(|_| invalid(&format!("invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(invalid("too many ':' separators"));
    }

    Ok((host.to_string(), port))
}
