//! Registry subject naming.
//!
//! A subject is the registry slot a schema is versioned under. The default
//! strategy ties it to the topic: `orders` → `orders-value` / `orders-key`.

use serde::{Deserialize, Serialize};

/// Which part of a record a subject describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    /// Record key
    Key,
    /// Record value
    Value,
}

impl SubjectKind {
    /// Suffix appended by [`SubjectNameStrategy::TopicName`].
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Value => "value",
        }
    }
}

/// How a topic and record name map to a registry subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectNameStrategy {
    /// `<topic>-<key|value>`
    #[default]
    TopicName,
    /// Fully-qualified record name, independent of the topic
    RecordName,
    /// `<topic>-<record name>`
    TopicRecordName,
}

impl SubjectNameStrategy {
    /// Build the subject for `topic`.
    ///
    /// `record_name` is only consulted by the record-based strategies; when
    /// it is missing they fall back to [`SubjectNameStrategy::TopicName`].
    ///
    /// # Examples
    ///
    /// ```
    /// use schemabus_wire::{SubjectKind, SubjectNameStrategy};
    ///
    /// let subject = SubjectNameStrategy::TopicName.subject("orders", SubjectKind::Value, None);
    /// assert_eq!(subject, "orders-value");
    /// ```
    #[must_use]
    pub fn subject(self, topic: &str, kind: SubjectKind, record_name: Option<&str>) -> String {
        match (self, record_name) {
            (Self::RecordName, Some(record)) => record.to_string(),
            (Self::TopicRecordName, Some(record)) => format!("{topic}-{record}"),
            _ => format!("{topic}-{}", kind.suffix()),
        }
    }

    /// Shorthand for the value subject of `topic` under the topic strategy.
    #[must_use]
    pub fn value_subject(topic: &str) -> String {
        Self::TopicName.subject(topic, SubjectKind::Value, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_strategy() {
        assert_eq!(SubjectNameStrategy::value_subject("payments"), "payments-value");
        assert_eq!(
            SubjectNameStrategy::TopicName.subject("payments", SubjectKind::Key, Some("ignored")),
            "payments-key"
        );
    }

    #[test]
    fn record_strategies() {
        let record = Some("com.example.Payment");
        assert_eq!(
            SubjectNameStrategy::RecordName.subject("payments", SubjectKind::Value, record),
            "com.example.Payment"
        );
        assert_eq!(
            SubjectNameStrategy::TopicRecordName.subject("payments", SubjectKind::Value, record),
            "payments-com.example.Payment"
        );
    }

    #[test]
    fn record_strategies_fall_back_without_name() {
        assert_eq!(
            SubjectNameStrategy::RecordName.subject("payments", SubjectKind::Value, None),
            "payments-value"
        );
    }
}
