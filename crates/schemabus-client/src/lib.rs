//! # schemabus client
//!
//! Schema-aware producer and consumer over a publish/subscribe transport.
//!
//! ## Data path
//!
//! ```text
//! Producer: value → schema cache → serialize → frame → transport publish (acked)
//! Consumer: transport poll → unframe → schema cache → deserialize → handler → commit
//! ```
//!
//! Records whose value is not framed, or whose schema cannot be resolved,
//! are delivered as [`Payload::Raw`] instead of failing the stream.
//!
//! ## Transports
//!
//! - [`transport::memory`]: in-process partitioned log with consumer groups
//! - [`transport::mqtt`]: MQTT broker via `rumqttc`
//! - `transport::kafka`: Kafka via `rdkafka` (cargo feature `kafka`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod record;
pub mod transport;

pub use config::{
    Acks, AutoOffsetReset, CommitPolicy, Compression, ConsumerConfig, HandlerErrorPolicy,
    ProducerConfig, SerializationMode, TransportKind,
};
pub use consumer::{Consumer, ConsumerState};
pub use error::{BoxError, ClientError, TransportError};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use producer::Producer;
pub use record::{Delivery, Headers, OutboundRecord, Payload, RawRecord, Record, TopicPartition};
pub use tokio_util::sync::CancellationToken;
