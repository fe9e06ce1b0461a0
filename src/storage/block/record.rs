//! Record layout inside a block region.
//!
//! `[key_len:u16 LE, high bit = tombstone][value_len:u16 LE][key][value]`,
//! repeated back to back and sorted by key.

use crate::primitives::bytes::le;
use crate::types::{BigMapError, Result};

/// Bytes taken by the two length fields.
pub const RECORD_HEADER_LEN: usize = 4;
/// Bit of the key-length field marking a deleted record.
pub const TOMBSTONE_BIT: u16 = 0x8000;
/// Longest key the layout can describe.
pub const MAX_KEY_LEN: usize = (TOMBSTONE_BIT - 1) as usize;
/// Longest value the layout can describe.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// Total encoded length of a record.
#[inline]
pub fn record_len(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_LEN + key_len + value_len
}

/// Decoded length fields of a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    /// Key length in bytes.
    pub key_len: usize,
    /// Value length in bytes.
    pub value_len: usize,
    /// Whether the tombstone bit is set.
    pub deleted: bool,
}

impl RecordHeader {
    /// Encoded length of the whole record.
    #[inline]
    pub fn len(&self) -> usize {
        record_len(self.key_len, self.value_len)
    }
}

/// Borrowed view of one record.
#[derive(Clone, Copy, Debug)]
pub struct RecordRef<'a> {
    /// Offset of the record within the block.
    pub offset: usize,
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes.
    pub value: &'a [u8],
    /// Whether the record is a tombstone.
    pub deleted: bool,
}

impl<'a> RecordRef<'a> {
    /// Offset one past the end of the record.
    pub fn end(&self) -> usize {
        self.offset + record_len(self.key.len(), self.value.len())
    }
}

/// Reads the header at `off`, checking it stays within `data`.
pub fn header_at(data: &[u8], off: usize) -> Result<RecordHeader> {
    if off + RECORD_HEADER_LEN > data.len() {
        return Err(BigMapError::Corruption("record header beyond used bytes"));
    }
    let raw_key = le::read_u16(data, off);
    let header = RecordHeader {
        key_len: (raw_key & !TOMBSTONE_BIT) as usize,
        value_len: le::read_u16(data, off + 2) as usize,
        deleted: raw_key & TOMBSTONE_BIT != 0,
    };
    if header.key_len == 0 {
        return Err(BigMapError::Corruption("record with empty key"));
    }
    if off + header.len() > data.len() {
        return Err(BigMapError::Corruption("record extends beyond used bytes"));
    }
    Ok(header)
}

/// Decodes the record at `off`.
pub fn decode_at(data: &[u8], off: usize) -> Result<RecordRef<'_>> {
    let header = header_at(data, off)?;
    let key_start = off + RECORD_HEADER_LEN;
    let value_start = key_start + header.key_len;
    Ok(RecordRef {
        offset: off,
        key: &data[key_start..value_start],
        value: &data[value_start..value_start + header.value_len],
        deleted: header.deleted,
    })
}

/// Writes a live record at `off`; the caller guarantees room.
pub fn encode_at(buf: &mut [u8], off: usize, key: &[u8], value: &[u8]) {
    debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LEN);
    debug_assert!(value.len() <= MAX_VALUE_LEN);
    le::write_u16(buf, off, key.len() as u16);
    le::write_u16(buf, off + 2, value.len() as u16);
    let key_start = off + RECORD_HEADER_LEN;
    buf[key_start..key_start + key.len()].copy_from_slice(key);
    let value_start = key_start + key.len();
    buf[value_start..value_start + value.len()].copy_from_slice(value);
}

/// Sets or clears the tombstone bit of the record at `off`.
pub fn set_deleted(buf: &mut [u8], off: usize, deleted: bool) {
    let raw = le::read_u16(buf, off);
    let next = if deleted {
        raw | TOMBSTONE_BIT
    } else {
        raw & !TOMBSTONE_BIT
    };
    le::write_u16(buf, off, next);
}

/// Iterator over all records (including tombstones) of a byte run.
pub struct RecordIter<'a> {
    data: &'a [u8],
    off: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    /// Iterates the records stored in `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            off: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<RecordRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.off >= self.data.len() {
            return None;
        }
        match decode_at(self.data, self.off) {
            Ok(record) => {
                self.off = record.end();
                Some(Ok(record))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_bit_exact() {
        let mut buf = vec![0u8; 16];
        encode_at(&mut buf, 0, b"ab", b"xyz");
        assert_eq!(&buf[..9], &[2, 0, 3, 0, b'a', b'b', b'x', b'y', b'z']);
        set_deleted(&mut buf, 0, true);
        assert_eq!(&buf[..2], &[2, 0x80]);
        let record = decode_at(&buf[..9], 0).unwrap();
        assert!(record.deleted);
        assert_eq!(record.key, b"ab");
        assert_eq!(record.value, b"xyz");
        set_deleted(&mut buf, 0, false);
        assert!(!decode_at(&buf[..9], 0).unwrap().deleted);
    }

    #[test]
    fn truncated_record_is_corruption() {
        let mut buf = vec![0u8; 9];
        encode_at(&mut buf, 0, b"ab", b"xyz");
        assert!(decode_at(&buf[..8], 0).is_err());
        assert!(header_at(&buf[..3], 0).is_err());
    }

    #[test]
    fn iterator_walks_back_to_back_records() {
        let mut buf = vec![0u8; 64];
        encode_at(&mut buf, 0, b"a", b"1");
        encode_at(&mut buf, 6, b"bb", b"");
        let used = 6 + record_len(2, 0);
        let keys: Vec<Vec<u8>> = RecordIter::new(&buf[..used])
            .map(|r| r.unwrap().key.to_vec())
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"bb".to_vec()]);
    }
}
