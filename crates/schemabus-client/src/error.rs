//! Client error taxonomy.

use schemabus_registry::CacheError;
use schemabus_wire::FrameError;
use std::time::Duration;

/// Boxed error returned by record handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by producers and consumers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Configuration rejected at construction time
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Value is not a well-formed frame
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Schema fetch, parse or registration failed
    #[error("schema resolution failed for topic {topic}: {source}")]
    Schema {
        /// Topic being produced to or consumed from
        topic: String,
        /// Underlying cache error
        source: CacheError,
    },

    /// Value could not be serialized
    #[error("serialization failed for topic {topic}: {message}")]
    Serialization {
        /// Topic being produced to
        topic: String,
        /// Serializer message
        message: String,
    },

    /// Broker unreachable, publish rejected, poll or commit failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A bounded operation ran out of time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Stopped on purpose through the cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Record handler returned an error
    #[error("handler failed for {topic}[{partition}]@{offset}: {source}")]
    Handler {
        /// Record topic
        topic: String,
        /// Record partition
        partition: i32,
        /// Record offset
        offset: i64,
        /// Handler error
        source: BoxError,
    },

    /// Consumer stopped on a handler failure and must be closed before the
    /// group can resume from the failed record
    #[error("consumer halted after handler failure at {topic}[{partition}]@{offset}")]
    Halted {
        /// Topic of the failed record
        topic: String,
        /// Partition of the failed record
        partition: i32,
        /// Offset of the failed record
        offset: i64,
    },

    /// Client already closed
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Whether this error means "stopped on purpose" rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error is a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Short label used for error metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config",
            Self::Frame(_) => "frame",
            Self::Schema { .. } => "schema",
            Self::Serialization { .. } => "serialization",
            Self::Transport(_) => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Handler { .. } => "handler",
            Self::Halted { .. } => "halted",
            Self::Closed => "closed",
        }
    }
}

/// Errors raised by a transport backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Broker address could not be parsed
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
    /// Connection to the broker failed or was lost
    #[error("connection error: {0}")]
    Connection(String),
    /// Broker rejected or failed to acknowledge a record
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscribing failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Fetching records failed
    #[error("poll error: {0}")]
    Poll(String),
    /// Committing offsets failed
    #[error("commit error: {0}")]
    Commit(String),
    /// Records were still unacknowledged when a flush deadline expired
    #[error("{remaining} record(s) still unacknowledged")]
    Unflushed {
        /// Records still in flight
        remaining: usize,
    },
    /// Transport has been shut down
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same call can succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Poll(_) | Self::Commit(_) | Self::Unflushed { .. }
        )
    }
}
