use chrono::{DateTime, Utc};

use crate::stream::codec::SchemaId;
use crate::stream::types::{Headers, Offset, Partition, RawRecord, TopicPartition};

/// A record paired with its decoded key and value
///
/// Built by the wire decoder and handed to the registered handler. The raw
/// bytes stay attached so failures can be dead-lettered verbatim.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope<K, V> {
    record: RawRecord,
    key: Option<K>,
    value: V,
    schema_id: SchemaId,
}

impl<K, V> DecodedEnvelope<K, V> {
    pub fn new(record: RawRecord, key: Option<K>, value: V, schema_id: SchemaId) -> Self {
        Self {
            record,
            key,
            value,
            schema_id,
        }
    }

    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    pub fn partition(&self) -> Partition {
        self.record.partition
    }

    pub fn offset(&self) -> Offset {
        self.record.offset
    }

    pub fn topic_partition(&self) -> TopicPartition {
        self.record.topic_partition()
    }

    /// Decoded key; `None` when the record was produced without one
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn headers(&self) -> &Headers {
        &self.record.headers
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.record.timestamp
    }

    /// Id of the writer schema the value was encoded with
    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    /// The undecoded record
    pub fn raw(&self) -> &RawRecord {
        &self.record
    }

    pub fn into_parts(self) -> (Option<K>, V, Headers) {
        (self.key, self.value, self.record.headers)
    }
}
