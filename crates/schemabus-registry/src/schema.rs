//! Parsed schemas and schema-typed serialization.

use crate::convert::{avro_to_json, json_to_avro};
use crate::registry::{RegisteredSchema, SchemaFormat};
use apache_avro::Schema as AvroSchema;

/// A schema parsed and ready for encoding and decoding.
#[derive(Debug, Clone)]
pub enum ParsedSchema {
    /// Avro schema; payloads are single Avro datums
    Avro(AvroSchema),
    /// JSON Schema document; payloads are UTF-8 JSON
    Json(serde_json::Value),
}

impl ParsedSchema {
    /// Parse schema text in the given format.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Parse`] if the text is not a valid schema.
    pub fn parse(format: SchemaFormat, text: &str) -> Result<Self, SchemaError> {
        match format {
            SchemaFormat::Avro => AvroSchema::parse_str(text)
                .map(Self::Avro)
                .map_err(|e| SchemaError::Parse(e.to_string())),
            SchemaFormat::Json => {
                let document: serde_json::Value =
                    serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))?;
                if !(document.is_object() || document.is_boolean()) {
                    return Err(SchemaError::Parse(
                        "JSON schema must be an object or a boolean".to_string(),
                    ));
                }
                Ok(Self::Json(document))
            }
        }
    }

    /// Format of this schema.
    #[must_use]
    pub fn format(&self) -> SchemaFormat {
        match self {
            Self::Avro(_) => SchemaFormat::Avro,
            Self::Json(_) => SchemaFormat::Json,
        }
    }

    /// Full name of the top-level record, if the schema names one.
    #[must_use]
    pub fn record_name(&self) -> Option<String> {
        match self {
            Self::Avro(AvroSchema::Record(record)) => Some(record.name.fullname(None)),
            Self::Avro(_) => None,
            Self::Json(document) => document
                .get("title")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }
    }

    /// Serialize `value` into a payload for this schema (unframed).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Serialize`] if `value` does not fit the schema.
    pub fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SchemaError> {
        match self {
            Self::Avro(schema) => {
                let datum =
                    json_to_avro(value, schema).map_err(|e| SchemaError::Serialize(e.to_string()))?;
                apache_avro::to_avro_datum(schema, datum)
                    .map_err(|e| SchemaError::Serialize(e.to_string()))
            }
            Self::Json(_) => {
                serde_json::to_vec(value).map_err(|e| SchemaError::Serialize(e.to_string()))
            }
        }
    }

    /// Deserialize an (unframed) payload written with this schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Deserialize`] if the payload cannot be read.
    pub fn deserialize(&self, payload: &[u8]) -> Result<serde_json::Value, SchemaError> {
        match self {
            Self::Avro(schema) => {
                let mut reader = payload;
                let value = apache_avro::from_avro_datum(schema, &mut reader, None)
                    .map_err(|e| SchemaError::Deserialize(e.to_string()))?;
                if !reader.is_empty() {
                    return Err(SchemaError::Deserialize(format!(
                        "{} trailing bytes after Avro datum",
                        reader.len()
                    )));
                }
                Ok(avro_to_json(&value))
            }
            Self::Json(_) => {
                serde_json::from_slice(payload).map_err(|e| SchemaError::Deserialize(e.to_string()))
            }
        }
    }
}

/// A registered, parsed schema. Shared read-only once cached.
#[derive(Debug, Clone)]
pub struct SchemaHandle {
    id: u32,
    subject: Option<String>,
    definition: String,
    parsed: ParsedSchema,
}

impl SchemaHandle {
    /// Parse a schema returned by the registry.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Parse`] if the schema text is invalid.
    pub fn from_registered(registered: RegisteredSchema) -> Result<Self, SchemaError> {
        let parsed = ParsedSchema::parse(registered.format, &registered.schema)?;
        Ok(Self {
            id: registered.id,
            subject: registered.subject,
            definition: registered.schema,
            parsed,
        })
    }

    /// Assemble a handle from already-parsed parts.
    #[must_use]
    pub fn new(id: u32, subject: Option<String>, definition: String, parsed: ParsedSchema) -> Self {
        Self {
            id,
            subject,
            definition,
            parsed,
        }
    }

    /// Registry id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Subject the schema was resolved through, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Raw schema text.
    #[must_use]
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Schema format.
    #[must_use]
    pub fn format(&self) -> SchemaFormat {
        self.parsed.format()
    }

    /// Parsed schema.
    #[must_use]
    pub fn parsed(&self) -> &ParsedSchema {
        &self.parsed
    }
}

/// Errors for schema parsing and schema-typed serialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    /// Schema text is invalid
    #[error("invalid schema: {0}")]
    Parse(String),
    /// Value does not match the schema
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Payload does not match the schema
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYMENT: &str = r#"{
        "type": "record",
        "name": "Payment",
        "namespace": "com.example",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "payee", "type": "string"},
            {"name": "cents", "type": "int"}
        ]
    }"#;

    #[test]
    fn avro_value_survives_serialization() {
        let schema = ParsedSchema::parse(SchemaFormat::Avro, PAYMENT).unwrap();
        let value = serde_json::json!({"id": 1, "payee": "ACME", "cents": 1999});

        let bytes = schema.serialize(&value).unwrap();
        assert_eq!(schema.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn avro_record_name_is_fully_qualified() {
        let schema = ParsedSchema::parse(SchemaFormat::Avro, PAYMENT).unwrap();
        assert_eq!(schema.record_name().as_deref(), Some("com.example.Payment"));
        assert_eq!(schema.format(), SchemaFormat::Avro);
    }

    #[test]
    fn invalid_avro_is_a_parse_error() {
        let err = ParsedSchema::parse(SchemaFormat::Avro, r#"{"type": "nope"}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Parse(_)));
    }

    #[test]
    fn avro_rejects_mismatched_values() {
        let schema = ParsedSchema::parse(SchemaFormat::Avro, PAYMENT).unwrap();
        let err = schema
            .serialize(&serde_json::json!({"id": "one", "payee": "ACME", "cents": 1}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::Serialize(_)));
    }

    #[test]
    fn avro_rejects_trailing_bytes() {
        let schema = ParsedSchema::parse(SchemaFormat::Avro, "\"int\"").unwrap();
        let mut bytes = schema.serialize(&serde_json::json!(3)).unwrap();
        bytes.push(0);
        assert!(matches!(
            schema.deserialize(&bytes),
            Err(SchemaError::Deserialize(_))
        ));
    }

    #[test]
    fn json_schema_payloads_are_json() {
        let schema = ParsedSchema::parse(
            SchemaFormat::Json,
            r#"{"title": "Payment", "type": "object"}"#,
        )
        .unwrap();
        let value = serde_json::json!({"payee": "ACME"});

        let bytes = schema.serialize(&value).unwrap();
        assert_eq!(bytes, br#"{"payee":"ACME"}"#);
        assert_eq!(schema.deserialize(&bytes).unwrap(), value);
        assert_eq!(schema.record_name().as_deref(), Some("Payment"));
    }

    #[test]
    fn json_schema_must_be_document() {
        assert!(ParsedSchema::parse(SchemaFormat::Json, "42").is_err());
        assert!(ParsedSchema::parse(SchemaFormat::Json, "{").is_err());
        assert!(ParsedSchema::parse(SchemaFormat::Json, "true").is_ok());
    }

    #[test]
    fn handle_from_registered() {
        let handle = SchemaHandle::from_registered(RegisteredSchema {
            id: 12,
            subject: Some("payments-value".to_string()),
            version: Some(1),
            format: SchemaFormat::Avro,
            schema: PAYMENT.to_string(),
        })
        .unwrap();

        assert_eq!(handle.id(), 12);
        assert_eq!(handle.subject(), Some("payments-value"));
        assert_eq!(handle.definition(), PAYMENT);
        assert_eq!(handle.format(), SchemaFormat::Avro);
    }
}
