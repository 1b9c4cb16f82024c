use bytes::Bytes;
use std::fmt::Debug;

use crate::stream::error::{Error, Result};

/// Decoding of record keys
///
/// Keys travel outside the schema-described value, so each key type knows its
/// own byte layout. Absent keys never reach `decode_key`; they surface as
/// `None` on the envelope.
pub trait RecordKey: Sized + Clone + Debug + Send + Sync + 'static {
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// 8-byte big-endian signed integer, the layout of a `long` key serializer
impl RecordKey for i64 {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            Error::CorruptEncoding(format!(
                "long key must be 8 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(i64::from_be_bytes(raw))
    }
}

impl RecordKey for String {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::CorruptEncoding(format!("key is not valid UTF-8: {}", e)))
    }
}

impl RecordKey for Bytes {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_key() {
        let bytes = 42i64.to_be_bytes();
        assert_eq!(i64::decode_key(&bytes).unwrap(), 42);

        let negative = (-7i64).to_be_bytes();
        assert_eq!(i64::decode_key(&negative).unwrap(), -7);
    }

    #[test]
    fn test_long_key_wrong_width() {
        let err = i64::decode_key(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, Error::CorruptEncoding(ref msg) if msg.contains("got 3")));
    }

    #[test]
    fn test_string_key() {
        assert_eq!(String::decode_key(b"user-1").unwrap(), "user-1");
        assert!(String::decode_key(&[0xc3, 0x28]).is_err());
    }

    #[test]
    fn test_bytes_key_passthrough() {
        let key = Bytes::decode_key(&[1, 2, 3]).unwrap();
        assert_eq!(&key[..], &[1, 2, 3]);
    }
}
