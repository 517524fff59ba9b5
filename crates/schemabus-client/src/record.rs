//! Records as seen by transports and by handlers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// String headers attached to a record.
pub type Headers = BTreeMap<String, String>;

/// A topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition id
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic partition.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A record ready to be handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Record key, possibly empty
    pub key: Vec<u8>,
    /// Record value, framed or not
    pub value: Vec<u8>,
    /// String headers
    pub headers: Headers,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Partition the record was written to
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// A record as delivered by a transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key, possibly empty
    pub key: Vec<u8>,
    /// Record value as received
    pub value: Vec<u8>,
    /// String headers
    pub headers: Headers,
    /// Broker or producer timestamp
    pub timestamp: DateTime<Utc>,
}

impl RawRecord {
    /// Topic partition this record came from.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Decoded record value.
///
/// Schema-carrying traffic decodes to [`Payload::Decoded`]; anything that is
/// not framed or whose schema cannot be resolved is passed through as
/// [`Payload::Raw`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Value decoded with its registry schema
    Decoded(serde_json::Value),
    /// Undecoded value bytes
    Raw(Vec<u8>),
}

impl Payload {
    /// The decoded value, if any.
    #[must_use]
    pub fn decoded(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Decoded(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// The raw bytes, if the value was not decoded.
    #[must_use]
    pub fn raw(&self) -> Option<&[u8]> {
        match self {
            Self::Decoded(_) => None,
            Self::Raw(bytes) => Some(bytes),
        }
    }

    /// Whether the value was decoded.
    #[must_use]
    pub fn is_decoded(&self) -> bool {
        matches!(self, Self::Decoded(_))
    }
}

/// A consumed record, handed to exactly one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    raw: RawRecord,
    value: Payload,
    schema_id: Option<u32>,
}

impl Record {
    /// Assemble a record from its raw form and decoding outcome.
    #[must_use]
    pub fn new(raw: RawRecord, value: Payload, schema_id: Option<u32>) -> Self {
        Self {
            raw,
            value,
            schema_id,
        }
    }

    /// Source topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.raw.topic
    }

    /// Source partition.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.raw.partition
    }

    /// Offset within the partition.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.raw.offset
    }

    /// Record key.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.raw.key
    }

    /// Record key as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw.key).ok()
    }

    /// Value bytes exactly as received, including the frame header.
    #[must_use]
    pub fn raw_value(&self) -> &[u8] {
        &self.raw.value
    }

    /// Decoded value or raw fallback.
    #[must_use]
    pub fn value(&self) -> &Payload {
        &self.value
    }

    /// Headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.raw.headers
    }

    /// Timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.raw.timestamp
    }

    /// Schema id from the frame header, if the value was framed.
    #[must_use]
    pub fn schema_id(&self) -> Option<u32> {
        self.schema_id
    }

    /// Deserialize the decoded value into a domain type.
    ///
    /// Returns `None` for raw payloads.
    ///
    /// # Errors
    ///
    /// Returns error if the decoded value does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.value
            .decoded()
            .map(|value| serde_json::from_value(value.clone()))
    }
}
