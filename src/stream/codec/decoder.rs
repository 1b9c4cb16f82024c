use apache_avro::Schema;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::stream::{
    codec::{wire, RecordKey, SchemaCache, SchemaId},
    error::{Error, Result},
    types::{DecodedEnvelope, RawRecord},
};

/// Turns raw broker records into typed envelopes
///
/// Values are Avro binary datums written with the schema named by their id
/// and read with the decoder's reader schema. Decoding never has side effects
/// beyond filling the shared schema cache, so one decoder can serve any number
/// of loops.
///
/// # Errors
///
/// * `Error::CorruptEncoding` - missing payload, bad frame, truncated or trailing bytes, bad key
/// * `Error::SchemaMismatch` - unknown schema id, or a writer schema the reader cannot resolve
/// * `Error::SchemaRegistry` - the registry could not be reached
pub struct WireDecoder<K, V> {
    cache: Arc<SchemaCache>,
    reader_schema: Arc<Schema>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for WireDecoder<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            reader_schema: Arc::clone(&self.reader_schema),
            _marker: PhantomData,
        }
    }
}

impl<K, V> WireDecoder<K, V>
where
    K: RecordKey,
    V: DeserializeOwned,
{
    pub fn new(cache: Arc<SchemaCache>, reader_schema: Schema) -> Self {
        Self {
            cache,
            reader_schema: Arc::new(reader_schema),
            _marker: PhantomData,
        }
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    pub fn reader_schema(&self) -> &Schema {
        &self.reader_schema
    }

    /// Decode a record delivered by the broker
    ///
    /// The schema id comes from the `schema.id` header when present (the value
    /// is then an unframed datum), otherwise from the value's frame.
    pub async fn decode(&self, record: RawRecord) -> Result<DecodedEnvelope<K, V>> {
        let payload = record
            .value
            .clone()
            .ok_or_else(|| Error::CorruptEncoding("record has no payload".to_string()))?;

        let out_of_band = wire::header_schema_id(&record.headers)?;
        let (key, value, schema_id) = self
            .decode_parts(record.key.as_deref(), &payload, out_of_band)
            .await?;

        Ok(DecodedEnvelope::new(record, key, value, schema_id))
    }

    /// Decode key and value bytes
    ///
    /// With `schema_id` set, `value` is a bare datum; with `None`, it must be framed.
    pub async fn decode_parts(
        &self,
        key: Option<&[u8]>,
        value: &[u8],
        schema_id: Option<SchemaId>,
    ) -> Result<(Option<K>, V, SchemaId)> {
        let key = key.map(K::decode_key).transpose()?;

        let (schema_id, body) = match schema_id {
            Some(id) => (id, value),
            None => wire::split_frame(value)?,
        };

        let writer_schema = self.cache.resolve(schema_id).await?;
        let value = self.decode_body(schema_id, &writer_schema, body)?;

        Ok((key, value, schema_id))
    }

    fn decode_body(&self, schema_id: SchemaId, writer_schema: &Schema, body: &[u8]) -> Result<V> {
        let mut reader = body;
        let written = apache_avro::from_avro_datum(writer_schema, &mut reader, None).map_err(|e| {
            Error::CorruptEncoding(format!("datum does not match writer schema {}: {}", schema_id, e))
        })?;

        if !reader.is_empty() {
            return Err(Error::CorruptEncoding(format!(
                "{} trailing byte(s) after datum written with schema {}",
                reader.len(),
                schema_id
            )));
        }

        let resolved = written.resolve(&self.reader_schema).map_err(|e| {
            Error::SchemaMismatch(format!(
                "writer schema {} cannot be read as the expected record: {}",
                schema_id, e
            ))
        })?;

        apache_avro::from_value::<V>(&resolved).map_err(|e| {
            Error::SchemaMismatch(format!(
                "schema {} value does not fit the target type: {}",
                schema_id, e
            ))
        })
    }
}
