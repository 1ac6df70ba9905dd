use cairn_store::ObjectKind;
use cairn_types::ObjectId;

use crate::error::{PackError, PackResult};

/// Magic bytes opening every pack data file.
pub const PACK_MAGIC: &[u8; 4] = b"CPAK";
/// Current pack data format version.
pub const PACK_VERSION: u32 = 1;
/// Magic + version + object count.
pub const PACK_HEADER_LEN: u64 = 12;
/// BLAKE3 checksum closing every pack data file.
pub const PACK_TRAILER_LEN: u64 = 32;
/// Upper bound of an entry header: type byte plus two 10-byte varints.
pub const MAX_ENTRY_HEADER_LEN: usize = 1 + 10 + 10;

/// An object queued for writing into a pack.
#[derive(Clone, Debug)]
pub struct PackEntry {
    /// Content-addressed ID of the object.
    pub id: ObjectId,
    /// Kind recorded in the entry's type byte.
    pub kind: ObjectKind,
    /// Uncompressed data.
    pub data: Vec<u8>,
}

/// Decoded header of one pack entry.
///
/// Entries are self-delimiting: the header carries the compressed length, so
/// a reader positioned at an entry offset knows exactly how many bytes follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: ObjectKind,
    pub inflated_size: u64,
    pub compressed_size: u64,
    /// Bytes taken by the header itself.
    pub header_len: usize,
}

impl EntryHeader {
    /// Append the encoded header for an entry to `buf`.
    pub fn encode(buf: &mut Vec<u8>, kind: ObjectKind, inflated_size: u64, compressed_size: u64) {
        buf.push(kind.type_byte());
        encode_varint(buf, inflated_size);
        encode_varint(buf, compressed_size);
    }

    /// Parse a header from `data`, the bytes starting at pack offset `offset`.
    pub fn parse(data: &[u8], offset: u64) -> PackResult<Self> {
        let (&type_byte, rest) = data.split_first().ok_or_else(|| PackError::CorruptEntry {
            offset,
            reason: "entry header beyond pack data".into(),
        })?;
        let kind = ObjectKind::from_type_byte(type_byte).ok_or_else(|| PackError::CorruptEntry {
            offset,
            reason: format!("unknown type byte: {type_byte}"),
        })?;
        let (inflated_size, n1) = decode_varint(rest).map_err(|e| at_offset(e, offset))?;
        let (compressed_size, n2) = decode_varint(&rest[n1..]).map_err(|e| at_offset(e, offset))?;
        Ok(Self {
            kind,
            inflated_size,
            compressed_size,
            header_len: 1 + n1 + n2,
        })
    }

    /// Offset of the compressed payload for an entry starting at `offset`.
    pub fn payload_offset(&self, offset: u64) -> u64 {
        offset + self.header_len as u64
    }
}

fn at_offset(err: PackError, offset: u64) -> PackError {
    match err {
        PackError::CorruptEntry { reason, .. } => PackError::CorruptEntry { offset, reason },
        other => other,
    }
}

/// Encode a u64 as a variable-length integer.
pub(crate) fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a variable-length integer. Returns (value, bytes_consumed).
pub(crate) fn decode_varint(data: &[u8]) -> PackResult<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if shift >= 64 {
            return Err(PackError::CorruptEntry {
                offset: 0,
                reason: "varint overflow".into(),
            });
        }
    }
    Err(PackError::CorruptEntry {
        offset: 0,
        reason: "truncated varint".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_small_takes_one_byte() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 42);
        assert_eq!(decode_varint(&buf).unwrap(), (42, 1));
    }

    #[test]
    fn varint_max_u64() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        let (val, _) = decode_varint(&buf).unwrap();
        assert_eq!(val, u64::MAX);
    }

    #[test]
    fn decode_varint_truncated() {
        let err = decode_varint(&[0x80]).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { .. }));
    }

    #[test]
    fn header_parse_reads_encoded_fields() {
        let mut buf = Vec::new();
        EntryHeader::encode(&mut buf, ObjectKind::Tree, 100_000, 300);
        buf.extend_from_slice(b"payload");

        let header = EntryHeader::parse(&buf, 12).unwrap();
        assert_eq!(header.kind, ObjectKind::Tree);
        assert_eq!(header.inflated_size, 100_000);
        assert_eq!(header.compressed_size, 300);
        assert_eq!(header.header_len, 1 + 3 + 2);
        assert_eq!(header.payload_offset(12), 18);
        assert!(header.header_len <= MAX_ENTRY_HEADER_LEN);
    }

    #[test]
    fn header_parse_unknown_type_reports_offset() {
        let err = EntryHeader::parse(&[9, 1, 1], 77).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { offset: 77, .. }));
    }

    #[test]
    fn header_parse_truncated_size_reports_offset() {
        let err = EntryHeader::parse(&[1, 0x80], 40).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { offset: 40, .. }));
    }

    #[test]
    fn header_parse_empty() {
        assert!(EntryHeader::parse(&[], 0).is_err());
    }
}
