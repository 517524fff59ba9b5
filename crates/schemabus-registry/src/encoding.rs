//! Path encoding for registry subjects.
//!
//! Subjects are free-form strings (record names contain `.`, topic names may
//! contain `/` on some brokers) and must be percent-encoded before they are
//! placed in a URL path segment.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Everything except the RFC 3986 unreserved set is escaped.
const SUBJECT_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a subject for use as a single path segment.
///
/// # Examples
///
/// ```
/// use schemabus_registry::encoding::encode_subject;
///
/// assert_eq!(encode_subject("orders-value"), "orders-value");
/// assert_eq!(encode_subject("tenant/orders-value"), "tenant%2Forders-value");
/// ```
#[must_use]
pub fn encode_subject(subject: &str) -> String {
    utf8_percent_encode(subject, SUBJECT_ESCAPE).to_string()
}

/// Decode a percent-encoded subject.
///
/// # Errors
///
/// Returns error if the decoded bytes are not valid UTF-8.
pub fn decode_subject(encoded: &str) -> Result<String, EncodingError> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| EncodingError::Utf8Decode(e.to_string()))
}

/// Errors for subject decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
    /// Decoded bytes are not UTF-8
    #[error("UTF-8 decode error: {0}")]
    Utf8Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreserved_characters_pass_through() {
        assert_eq!(encode_subject("com.example.Order_v2~x"), "com.example.Order_v2~x");
    }

    #[test]
    fn reserved_characters_are_escaped() {
        assert_eq!(encode_subject("a b?c#d"), "a%20b%3Fc%23d");
        assert_eq!(encode_subject("topic:value"), "topic%3Avalue");
    }

    #[test]
    fn decode_reverses_encode() {
        let subject = "tenant/événements-value";
        assert_eq!(decode_subject(&encode_subject(subject)).unwrap(), subject);
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert!(decode_subject("%ff%fe").is_err());
    }
}
