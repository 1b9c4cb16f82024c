use bytes::{BufMut, Bytes, BytesMut};

use crate::stream::{
    error::{Error, Result},
    types::Headers,
};

/// Identifier of a writer schema in the registry
pub type SchemaId = u32;

/// First byte of every framed value
pub const MAGIC_BYTE: u8 = 0x00;

/// Magic byte plus the big-endian schema id
pub const FRAME_HEADER_LEN: usize = 5;

/// Header carrying an out-of-band schema id (decimal text); the value is then an unframed datum
pub const SCHEMA_ID_HEADER: &str = "schema.id";

/// Split a framed value into its schema id and datum body
///
/// Frame layout:
/// - byte 0: magic byte (`0x00`)
/// - bytes 1-4: schema id (big-endian)
/// - bytes 5..: binary datum
///
/// # Example
///
/// ```
/// use consumer_pipeline::stream::codec::split_frame;
///
/// let (schema_id, body) = split_frame(&[0x00, 0, 0, 0, 42, 0x02]).unwrap();
/// assert_eq!(schema_id, 42);
/// assert_eq!(body, &[0x02]);
/// ```
pub fn split_frame(bytes: &[u8]) -> Result<(SchemaId, &[u8])> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(Error::CorruptEncoding(format!(
            "frame is {} byte(s), expected at least {}",
            bytes.len(),
            FRAME_HEADER_LEN
        )));
    }

    if bytes[0] != MAGIC_BYTE {
        return Err(Error::CorruptEncoding(format!(
            "bad magic byte 0x{:02x}",
            bytes[0]
        )));
    }

    let schema_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((schema_id, &bytes[FRAME_HEADER_LEN..]))
}

/// Frame a datum body with its schema id
pub fn encode_frame(schema_id: SchemaId, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_u32(schema_id);
    buf.put_slice(body);
    buf.freeze()
}

/// Read the out-of-band schema id header, if the record carries one
pub fn header_schema_id(headers: &Headers) -> Result<Option<SchemaId>> {
    let Some(raw) = headers.get(SCHEMA_ID_HEADER) else {
        return Ok(None);
    };

    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<SchemaId>().ok())
        .map(Some)
        .ok_or_else(|| {
            Error::CorruptEncoding(format!("invalid {} header: {:?}", SCHEMA_ID_HEADER, raw))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_split() {
        let framed = encode_frame(258, b"payload");
        assert_eq!(&framed[..5], &[0x00, 0x00, 0x00, 0x01, 0x02]);

        let (schema_id, body) = split_frame(&framed).unwrap();
        assert_eq!(schema_id, 258);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn test_split_rejects_bad_magic() {
        let err = split_frame(&[0x01, 0, 0, 0, 1, 2]).unwrap_err();
        assert!(matches!(err, Error::CorruptEncoding(ref msg) if msg.contains("0x01")));
    }

    #[test]
    fn test_split_rejects_short_frame() {
        let err = split_frame(&[0x00, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::CorruptEncoding(_)));
        assert!(split_frame(&[]).is_err());
    }

    #[test]
    fn test_split_allows_empty_body() {
        let (schema_id, body) = split_frame(&[0x00, 0, 0, 0, 9]).unwrap();
        assert_eq!(schema_id, 9);
        assert!(body.is_empty());
    }

    #[test]
    fn test_header_schema_id() {
        assert_eq!(header_schema_id(&Headers::new()).unwrap(), None);

        let headers = Headers::new().with(SCHEMA_ID_HEADER, "17");
        assert_eq!(header_schema_id(&headers).unwrap(), Some(17));

        let headers = Headers::new().with(SCHEMA_ID_HEADER, "seventeen");
        assert!(matches!(
            header_schema_id(&headers),
            Err(Error::CorruptEncoding(_))
        ));
    }
}
