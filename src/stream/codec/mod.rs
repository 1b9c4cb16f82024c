//! Wire decoding of schema-described records
//!
//! Values are Avro binary datums. The writer schema is identified either by
//! the frame around the datum (magic byte `0x00` followed by a big-endian
//! `u32` schema id) or by a `schema.id` header. Writer schemas are looked up
//! through a [`SchemaRegistry`] and cached process-wide in a [`SchemaCache`];
//! the [`WireDecoder`] resolves each datum against the consumer's reader
//! schema and deserializes it into the target type.

pub mod decoder;
pub mod key;
pub mod registry;
pub mod wire;

pub use decoder::WireDecoder;
pub use key::RecordKey;
pub use registry::{HttpSchemaRegistry, MemorySchemaRegistry, SchemaCache, SchemaRegistry};
pub use wire::{encode_frame, split_frame, SchemaId, FRAME_HEADER_LEN, MAGIC_BYTE, SCHEMA_ID_HEADER};
