//! CLI configuration loaded from the environment.

use anyhow::{Context, Result};
use schemabus_client::{
    Acks, AutoOffsetReset, Compression, ConsumerConfig, HandlerErrorPolicy, ProducerConfig,
    SerializationMode, TransportKind,
};
use schemabus_registry::RegistryAuth;

/// Settings shared by the `produce` and `consume` commands.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Transport backend
    pub transport: TransportKind,
    /// Comma-separated broker list
    pub bootstrap_servers: String,
    /// Schema registry base URL
    pub schema_registry_url: String,
    /// Bearer token for the registry
    pub registry_token: Option<String>,
    /// Consumer group id
    pub group_id: String,
    /// Topics consumed by `consume`
    pub topics: Vec<String>,
    /// Start position for a new group
    pub auto_offset_reset: AutoOffsetReset,
    /// Producer acknowledgement level
    pub acks: Acks,
    /// Producer compression
    pub compression: Compression,
    /// Handler failure behaviour for `consume`
    pub handler_error_policy: HandlerErrorPolicy,
    /// Registry-framed or plain JSON values
    pub serialization: SerializationMode,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Kafka,
            bootstrap_servers: "localhost:9092".to_string(),
            schema_registry_url: "http://localhost:8081".to_string(),
            registry_token: None,
            group_id: "schemabus-cli".to_string(),
            topics: Vec::new(),
            auto_offset_reset: AutoOffsetReset::Earliest,
            acks: Acks::All,
            compression: Compression::Snappy,
            handler_error_policy: HandlerErrorPolicy::LogAndContinue,
            serialization: SerializationMode::Schema,
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCHEMABUS_TRANSPORT`: "kafka" or "mqtt"
    /// - `KAFKA_BOOTSTRAP_SERVERS`: comma-separated `host:port` list
    /// - `SCHEMA_REGISTRY_URL`: registry base URL
    /// - `SCHEMA_REGISTRY_TOKEN`: bearer token for the registry
    /// - `KAFKA_GROUP_ID`: consumer group id
    /// - `KAFKA_TOPICS`: comma-separated topics for `consume`
    /// - `KAFKA_AUTO_OFFSET_RESET`: "earliest" or "latest"
    /// - `KAFKA_ACKS`: "0", "1" or "all"
    /// - `KAFKA_COMPRESSION`: none, snappy, gzip, lz4 or zstd
    /// - `SCHEMABUS_HANDLER_ERROR_POLICY`: "fail_fast" or "log_and_continue"
    /// - `SCHEMABUS_USE_JSON`: send and read plain JSON instead of framed values
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an unrecognised value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(transport) = lookup("SCHEMABUS_TRANSPORT") {
            config.transport = transport.parse().context("Invalid SCHEMABUS_TRANSPORT")?;
            if config.transport == TransportKind::Mqtt {
                config.bootstrap_servers = "tcp://localhost:1883".to_string();
            }
        }

        if let Some(servers) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            config.bootstrap_servers = servers;
        }

        if let Some(url) = lookup("SCHEMA_REGISTRY_URL") {
            config.schema_registry_url = url;
        }

        config.registry_token = lookup("SCHEMA_REGISTRY_TOKEN");

        if let Some(group) = lookup("KAFKA_GROUP_ID") {
            config.group_id = group;
        }

        if let Some(topics) = lookup("KAFKA_TOPICS") {
            config.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(reset) = lookup("KAFKA_AUTO_OFFSET_RESET") {
            config.auto_offset_reset = reset.parse().context("Invalid KAFKA_AUTO_OFFSET_RESET")?;
        }

        if let Some(acks) = lookup("KAFKA_ACKS") {
            config.acks = acks.parse().context("Invalid KAFKA_ACKS")?;
        }

        if let Some(compression) = lookup("KAFKA_COMPRESSION") {
            config.compression = compression.parse().context("Invalid KAFKA_COMPRESSION")?;
        }

        if let Some(policy) = lookup("SCHEMABUS_HANDLER_ERROR_POLICY") {
            config.handler_error_policy = policy
                .parse()
                .context("Invalid SCHEMABUS_HANDLER_ERROR_POLICY")?;
        }

        if let Some(flag) = lookup("SCHEMABUS_USE_JSON") {
            if matches!(flag.as_str(), "1" | "true" | "yes") {
                config.serialization = SerializationMode::Json;
            }
        }

        Ok(config)
    }

    fn registry_auth(&self) -> Option<RegistryAuth> {
        self.registry_token.clone().map(RegistryAuth::Bearer)
    }

    /// Producer settings for the `produce` command.
    pub fn producer_config(&self) -> ProducerConfig {
        let mut config =
            ProducerConfig::new(self.bootstrap_servers.clone(), self.schema_registry_url.clone());
        config.transport = self.transport;
        config.registry_auth = self.registry_auth();
        config.acks = self.acks;
        config.enable_idempotence = self.acks == Acks::All;
        config.compression = self.compression;
        config.serialization = self.serialization;
        config
    }

    /// Consumer settings for the `consume` command.
    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(
            self.bootstrap_servers.clone(),
            self.schema_registry_url.clone(),
            self.group_id.clone(),
            self.topics.clone(),
        );
        config.transport = self.transport;
        config.registry_auth = self.registry_auth();
        config.auto_offset_reset = self.auto_offset_reset;
        config.handler_error_policy = self.handler_error_policy;
        config.serialization = self.serialization;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CliConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        CliConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert_eq!(config.transport, TransportKind::Kafka);
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert!(config.producer_config().validate().is_ok());
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("SCHEMABUS_TRANSPORT", "mqtt"),
            ("KAFKA_BOOTSTRAP_SERVERS", "tcp://broker:1883"),
            ("SCHEMA_REGISTRY_URL", "https://registry:8081"),
            ("SCHEMA_REGISTRY_TOKEN", "secret"),
            ("KAFKA_GROUP_ID", "billing"),
            ("KAFKA_TOPICS", "payments, refunds,"),
            ("KAFKA_AUTO_OFFSET_RESET", "latest"),
            ("KAFKA_ACKS", "1"),
            ("KAFKA_COMPRESSION", "zstd"),
            ("SCHEMABUS_HANDLER_ERROR_POLICY", "fail_fast"),
            ("SCHEMABUS_USE_JSON", "true"),
        ])
        .unwrap();

        assert_eq!(config.transport, TransportKind::Mqtt);
        assert_eq!(config.topics, vec!["payments", "refunds"]);
        assert_eq!(config.auto_offset_reset, AutoOffsetReset::Latest);
        assert_eq!(config.serialization, SerializationMode::Json);

        let producer = config.producer_config();
        assert_eq!(producer.acks, Acks::Leader);
        assert!(!producer.enable_idempotence);
        assert_eq!(producer.compression, Compression::Zstd);
        assert!(producer.validate().is_ok());

        let consumer = config.consumer_config();
        assert_eq!(consumer.group_id, "billing");
        assert_eq!(consumer.handler_error_policy, HandlerErrorPolicy::FailFast);
        assert!(consumer.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_values() {
        let err = load(&[("KAFKA_ACKS", "most")]).unwrap_err();
        assert!(err.to_string().contains("KAFKA_ACKS"));
    }
}
