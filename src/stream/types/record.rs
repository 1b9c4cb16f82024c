use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;

/// Partition index within a topic (non-negative)
pub type Partition = i32;

/// Position of a record within its partition
pub type Offset = i64;

/// Consumer group generation, bumped by the coordinator on every rebalance
pub type Generation = i32;

/// A (topic, partition) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: Partition,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: Partition) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Record headers
///
/// Insertion order is not preserved; lookups are by exact name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, Bytes>);

impl Headers {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Add a header (builder pattern)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.0.get(name)
    }

    /// Get a header value as UTF-8 text, if present and valid
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, Bytes> {
        self.0.iter()
    }
}

impl FromIterator<(String, Bytes)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, Bytes)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A record exactly as the broker delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Topic the record was read from
    pub topic: String,

    /// Partition within the topic
    pub partition: Partition,

    /// Offset within the partition
    pub offset: Offset,

    /// Raw key bytes (absent for unkeyed records)
    pub key: Option<Bytes>,

    /// Raw value bytes (absent for tombstones)
    pub value: Option<Bytes>,

    /// Record headers
    pub headers: Headers,

    /// Broker-assigned timestamp, if any
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Low and high watermarks of a partition
///
/// `low` is the first offset still in the log, `high` the offset the next
/// produced record will receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub low: Offset,
    pub high: Offset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display_and_order() {
        let a = TopicPartition::new("notifications", 0);
        let b = TopicPartition::new("notifications", 1);
        assert_eq!(a.to_string(), "notifications-0");
        assert!(a < b);
    }

    #[test]
    fn test_headers_lookup() {
        let headers = Headers::new()
            .with("schema.id", Bytes::from_static(b"7"))
            .with("trace", Bytes::from_static(&[0xff, 0xfe]));

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get_str("schema.id"), Some("7"));
        // not UTF-8
        assert_eq!(headers.get_str("trace"), None);
        assert!(headers.get("missing").is_none());
    }

    #[test]
    fn test_headers_equality_ignores_insertion_order() {
        let a = Headers::new().with("a", "1").with("b", "2");
        let b = Headers::new().with("b", "2").with("a", "1");
        assert_eq!(a, b);
    }
}
