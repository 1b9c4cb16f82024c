pub mod envelope;
pub mod record;

pub use envelope::DecodedEnvelope;
pub use record::{Generation, Headers, Offset, Partition, RawRecord, TopicPartition, Watermarks};
