//! The registry operations consumed by the schema cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema language of a registered schema.
///
/// Serialized the way the registry reports `schemaType`; a missing
/// `schemaType` means Avro.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaFormat {
    /// Apache Avro, binary datum encoding
    #[default]
    Avro,
    /// JSON Schema, UTF-8 JSON documents
    Json,
}

impl fmt::Display for SchemaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avro => f.write_str("AVRO"),
            Self::Json => f.write_str("JSON"),
        }
    }
}

/// A schema as returned by the registry, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSchema {
    /// Registry-assigned id
    pub id: u32,
    /// Subject, when the lookup was subject-based
    pub subject: Option<String>,
    /// Version under `subject`, when known
    pub version: Option<u32>,
    /// Schema language
    pub format: SchemaFormat,
    /// Raw schema text
    pub schema: String,
}

/// Remote schema registry operations.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Fetch the schema registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns error on network failures or if the id is unknown.
    async fn schema_by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError>;

    /// Fetch the latest version registered under `subject`.
    ///
    /// # Errors
    ///
    /// Returns error on network failures or if the subject is unknown.
    async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema, RegistryError>;

    /// Register `schema` under `subject`, or return the existing id when an
    /// identical schema is already registered.
    ///
    /// # Errors
    ///
    /// Returns error on network failures or if the registry rejects the
    /// schema (for example an incompatible evolution).
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        format: SchemaFormat,
    ) -> Result<u32, RegistryError>;
}

/// Errors that can occur talking to a schema registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Client initialization failed
    #[error("registry client init error: {0}")]
    Init(String),
    /// HTTP request failed
    #[error("registry request error: {0}")]
    Request(String),
    /// Registry returned an error status
    #[error("registry API error (status {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Registry-specific error code, e.g. 40401 for an unknown subject
        error_code: Option<i64>,
        /// Error message from the registry
        message: String,
    },
    /// Response parsing failed
    #[error("registry response parse error: {0}")]
    Parse(String),
}

impl RegistryError {
    /// Whether the registry reported that the schema or subject does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// Whether the registry rejected a schema as incompatible.
    #[must_use]
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }
}
