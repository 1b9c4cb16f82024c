// Domain records carried on the notification topic

use apache_avro::{types::Value, Schema};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stream::error::Result;

/// Avro schema of [`Notification`] (`createdAt` is a millisecond timestamp)
pub const NOTIFICATION_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Notification",
    "namespace": "notifications.avro.v1",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "message", "type": "string"},
        {"name": "createdAt", "type": {"type": "long", "logicalType": "timestamp-millis"}}
    ]
}"#;

/// A notification, keyed on the topic by its `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub message: String,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl Notification {
    /// Create a notification stamped with the current time
    pub fn new(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at.timestamp_millis();
        self
    }

    pub fn schema() -> Result<Schema> {
        Ok(Schema::parse_str(NOTIFICATION_SCHEMA)?)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at)
    }

    /// Record key as written by producers: the id as an 8-byte big-endian long
    pub fn key(&self) -> Bytes {
        Bytes::copy_from_slice(&self.id.to_be_bytes())
    }

    /// Encode as a bare Avro datum with `schema`
    pub fn to_avro(&self, schema: &Schema) -> Result<Vec<u8>> {
        let record = Value::Record(vec![
            ("id".to_string(), Value::Long(self.id)),
            ("message".to_string(), Value::String(self.message.clone())),
            ("createdAt".to_string(), Value::TimestampMillis(self.created_at)),
        ]);
        Ok(apache_avro::to_avro_datum(schema, record)?)
    }
}

/// Renders the record as JSON, the way Avro records print themselves
impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
