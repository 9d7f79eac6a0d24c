//! Dead-letter record framing

use super::DeadLetter;
use crate::{BridgeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const RECORD_VERSION: u8 = 1;

/// Serialize a dead letter with length prefix and CRC checksum
///
/// Format:
/// - 4 bytes: record length (excluding this field)
/// - 1 byte: record version
/// - 4 bytes: payload length
/// - N bytes: payload (bincode)
/// - 4 bytes: CRC32 checksum of version + payload fields
pub fn encode_record(letter: &DeadLetter) -> Result<Bytes> {
    let payload =
        bincode::serialize(letter).map_err(|e| BridgeError::InvalidFormat(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(payload.len() + 13);

    // Reserve space for length prefix
    buf.put_u32_le(0);
    buf.put_u8(RECORD_VERSION);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);

    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    let len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());

    Ok(buf.freeze())
}

/// Deserialize one record from the start of `data`.
///
/// Returns `Ok(None)` when `data` ends before the record does, which is what
/// a write torn by a crash looks like.
pub fn decode_record(data: &[u8]) -> Result<Option<(DeadLetter, usize)>> {
    if data.len() < 4 {
        return Ok(None);
    }

    let len = (&data[..4]).get_u32_le() as usize;
    if data.len() < 4 + len {
        return Ok(None);
    }
    if len < 9 {
        return Err(BridgeError::InvalidFormat(format!("record length {} too small", len)));
    }

    let record = &data[4..4 + len];
    let (body, trailer) = record.split_at(len - 4);

    let expected = (&trailer[..]).get_u32_le();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(BridgeError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = body;
    let version = cursor.get_u8();
    if version != RECORD_VERSION {
        return Err(BridgeError::InvalidFormat(format!(
            "unsupported record version {}",
            version
        )));
    }

    let payload_len = cursor.get_u32_le() as usize;
    if cursor.len() != payload_len {
        return Err(BridgeError::InvalidFormat("payload length mismatch".into()));
    }

    let letter =
        bincode::deserialize(cursor).map_err(|e| BridgeError::InvalidFormat(e.to_string()))?;

    Ok(Some((letter, 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::DeadLetterReason;
    use crate::{Batch, FieldValue, Point};

    fn letter() -> DeadLetter {
        let points = vec![
            Point::builder("temperature")
                .with_tag("sensor", "s1")
                .with_field("value", FieldValue::Float(23.5))
                .with_field("label", "warm")
                .at(1_000_000)
                .build()
                .unwrap(),
        ];
        DeadLetter::new(Batch::new(3, points), DeadLetterReason::NonRetryable, 1, "400 bad field")
    }

    #[test]
    fn test_record_serialization() {
        let letter = letter();
        let encoded = encode_record(&letter).unwrap();

        let (decoded, len) = decode_record(&encoded).unwrap().unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(decoded, letter);
    }

    #[test]
    fn test_checksum_validation() {
        let mut encoded = encode_record(&letter()).unwrap().to_vec();

        // Corrupt the data
        encoded[10] ^= 0xFF;

        let result = decode_record(&encoded);
        assert!(matches!(result, Err(BridgeError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_torn_record() {
        let encoded = encode_record(&letter()).unwrap();
        assert!(decode_record(&encoded[..2]).unwrap().is_none());
        assert!(decode_record(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }
}
