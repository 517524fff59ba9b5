//! Conversions between Avro values and JSON values.

use apache_avro::types::Value;
use apache_avro::Schema;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Render a decoded Avro value as JSON.
///
/// Bytes and fixed values become base64 strings, enums their symbol, and
/// unions their selected branch.
pub(crate) fn avro_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::json!(i),
        Value::Long(l) => serde_json::json!(l),
        Value::Float(f) => serde_json::json!(f),
        Value::Double(d) => serde_json::json!(d),
        Value::Bytes(b) | Value::Fixed(_, b) => serde_json::Value::String(STANDARD.encode(b)),
        Value::String(s) | Value::Enum(_, s) => serde_json::Value::String(s.clone()),
        Value::Union(_, inner) => avro_to_json(inner),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(avro_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), avro_to_json(v)))
                .collect(),
        ),
        Value::Record(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), avro_to_json(v)))
                .collect(),
        ),
        // Logical types: dates, timestamps, decimals, uuids.
        other => serde_json::Value::try_from(other.clone()).unwrap_or(serde_json::Value::Null),
    }
}

/// Build an Avro value for `schema` from JSON.
///
/// The generic JSON → Avro mapping is resolved against the schema, which
/// handles numeric widening, record field defaults, enum symbols and union
/// branch selection.
pub(crate) fn json_to_avro(
    value: &serde_json::Value,
    schema: &Schema,
) -> Result<Value, apache_avro::Error> {
    Value::from(value.clone()).resolve(schema)
}
