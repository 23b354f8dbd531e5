//! Record framing for WAL and segment files.
//!
//! Each record is JSON framed with a version byte, a little-endian length
//! and a CRC32 of the payload:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][json: N bytes][crc32: 4 bytes LE]
//! ```
//!
//! Files start with [`MAGIC`] followed by the codec version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying KyroLink files.
pub const MAGIC: [u8; 4] = *b"KLNK";

/// Upper bound on a single record (64 MiB).
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Size of the framing around a payload.
pub const FRAME_OVERHEAD: u64 = 1 + 4 + 4;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encodes a value as one framed record.
///
/// # Errors
/// `InvalidData` if the value cannot be serialized or is too large.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    if data.len() > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {} exceeds maximum {MAX_RECORD_SIZE}", data.len()),
        ));
    }
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "record length overflows u32"))?;

    let mut out = Vec::with_capacity(data.len() + 9);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Decodes one framed record, verifying its checksum.
///
/// # Errors
/// - `UnexpectedEof` on a truncated record
/// - `InvalidData` on a version mismatch, oversized length, CRC mismatch or
///   malformed JSON
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Writes the file header.
///
/// # Errors
/// Propagates write errors.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and checks the file header, returning the codec version.
///
/// # Errors
/// `InvalidData` if the magic bytes do not match.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

/// Length of the file header.
pub const HEADER_LEN: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::feature::FeatureSet;
    use crate::kind::AttributeKind;

    #[test]
    fn test_feature_set_survives_framing() {
        let features = FeatureSet::new()
            .with(AttributeKind::Person, "Ada Lovelace")
            .with(AttributeKind::Email, "ada@example.org");
        let encoded = encode(&features).unwrap();
        let json_len = serde_json::to_vec(&features).unwrap().len() as u64;
        assert_eq!(encoded.len() as u64, FRAME_OVERHEAD + json_len);

        let decoded: FeatureSet = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(decoded, features);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"payload bytes".to_string()).unwrap();
        encoded[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_record_is_eof() {
        let encoded = encode(&"payload bytes".to_string()).unwrap();
        let cut = encoded[..encoded.len() - 2].to_vec();
        let err = decode::<String>(&mut Cursor::new(cut)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&(200_000_000u32).to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_rejects_foreign_file() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);

        let err = read_header(&mut Cursor::new(b"KYRO\x01".to_vec())).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }
}
