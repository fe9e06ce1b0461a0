//! Byte layout of packed multi-field values and their chunk keys.
//!
//! Value: `[count:u16 LE]` then `[field len varint][value len varint][field][value]`
//! per element, sorted by field.
//!
//! Chunk key: `[user key len:u32 BE][user key][marker]`, where the marker of
//! the first chunk is a single `0x00` and every later chunk uses the first
//! field it holds.

use crate::primitives::bytes::{buf::Cursor, le, ord, var};
use crate::types::{BigMapError, Result};

/// Bytes taken by the element count.
pub const COUNT_LEN: usize = 2;
/// Marker byte of the first chunk of a user key.
pub const FIRST_CHUNK_MARKER: u8 = 0x00;

/// One field/value pair of a packed value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Element<'a> {
    /// Field name, never empty.
    pub field: &'a [u8],
    /// Field value.
    pub value: &'a [u8],
}

impl Element<'_> {
    /// Encoded size of the element.
    pub fn encoded_len(&self) -> usize {
        var::encoded_len(self.field.len() as u32)
            + var::encoded_len(self.value.len() as u32)
            + self.field.len()
            + self.value.len()
    }
}

/// Validated, borrowed view of a packed value.
#[derive(Clone, Copy, Debug)]
pub struct PackedValue<'a> {
    raw: &'a [u8],
    count: usize,
}

impl<'a> PackedValue<'a> {
    /// Checks the layout of `raw`: element count, sizes and field order.
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < COUNT_LEN {
            return Err(BigMapError::Corruption("packed value shorter than its header"));
        }
        let value = Self {
            raw,
            count: le::read_u16(raw, 0) as usize,
        };
        let mut seen = 0;
        let mut prev: Option<&[u8]> = None;
        for element in value.iter() {
            let element = element?;
            if element.field.is_empty() {
                return Err(BigMapError::Corruption("packed value with empty field"));
            }
            if prev.is_some_and(|prev| prev >= element.field) {
                return Err(BigMapError::Corruption("packed fields out of order"));
            }
            prev = Some(element.field);
            seen += 1;
        }
        if seen != value.count {
            return Err(BigMapError::Corruption("packed value count mismatch"));
        }
        Ok(value)
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Iterates the elements in field order.
    pub fn iter(&self) -> ElementIter<'a> {
        ElementIter {
            cursor: Cursor::at(self.raw, COUNT_LEN),
            failed: false,
        }
    }

    /// Collects all elements.
    pub fn elements(&self) -> Result<Vec<Element<'a>>> {
        self.iter().collect()
    }

    /// Value stored for `field`.
    pub fn find(&self, field: &[u8]) -> Result<Option<&'a [u8]>> {
        for element in self.iter() {
            let element = element?;
            if element.field == field {
                return Ok(Some(element.value));
            }
            if element.field > field {
                break;
            }
        }
        Ok(None)
    }
}

/// Iterator over the elements of a [`PackedValue`].
pub struct ElementIter<'a> {
    cursor: Cursor<'a>,
    failed: bool,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<Element<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.remaining() == 0 {
            return None;
        }
        let element = self.read_element();
        if element.is_err() {
            self.failed = true;
        }
        Some(element)
    }
}

impl<'a> ElementIter<'a> {
    fn read_element(&mut self) -> Result<Element<'a>> {
        let field_len = self.cursor.varint()? as usize;
        let value_len = self.cursor.varint()? as usize;
        let field = self.cursor.take(field_len)?;
        let value = self.cursor.take(value_len)?;
        Ok(Element { field, value })
    }
}

/// Encoded size of a value holding `elements`.
pub fn encoded_len(elements: &[Element<'_>]) -> usize {
    COUNT_LEN + elements.iter().map(Element::encoded_len).sum::<usize>()
}

/// Rejects a field or value whose length has no varint encoding.
pub fn check_element(field: &[u8], value: &[u8]) -> Result<()> {
    let limit = var::MAX_VALUE as usize;
    if field.len() > limit {
        return Err(BigMapError::Invalid("packed field longer than 2^28 - 1 bytes"));
    }
    if value.len() > limit {
        return Err(BigMapError::Invalid("packed value longer than 2^28 - 1 bytes"));
    }
    Ok(())
}

/// Appends the encoding of `elements`, which must be sorted by field.
pub fn encode(elements: &[Element<'_>], out: &mut Vec<u8>) -> Result<()> {
    let count = u16::try_from(elements.len())
        .map_err(|_| BigMapError::Invalid("too many fields in one packed value"))?;
    for element in elements {
        check_element(element.field, element.value)?;
    }
    out.extend_from_slice(&count.to_le_bytes());
    for element in elements {
        out.reserve(element.encoded_len());
        var::encode_u32(element.field.len() as u32, out);
        var::encode_u32(element.value.len() as u32, out);
        out.extend_from_slice(element.field);
        out.extend_from_slice(element.value);
    }
    Ok(())
}

/// Index of the first element of the right half of a balanced split.
///
/// Picks the element boundary that leaves the two encoded halves closest in
/// size; on a tie the left half keeps the extra element. `None` for fewer
/// than two elements.
pub fn split_point(elements: &[Element<'_>]) -> Option<usize> {
    if elements.len() < 2 {
        return None;
    }
    let total: usize = elements.iter().map(Element::encoded_len).sum();
    let mut left = 0usize;
    let mut best = (usize::MAX, 1);
    for (idx, element) in elements[..elements.len() - 1].iter().enumerate() {
        left += element.encoded_len();
        let diff = left.abs_diff(total - left);
        if diff <= best.0 {
            best = (diff, idx + 1);
        } else {
            break;
        }
    }
    Some(best.1)
}

/// Writes the `[len][user key]` prefix shared by all chunks of `key`.
pub fn chunk_prefix(key: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(key.len()).map_err(|_| BigMapError::Invalid("user key too long"))?;
    out.clear();
    ord::put_u32_be(out, len);
    out.extend_from_slice(key);
    Ok(())
}

/// Whether `key` is a chunk key under `prefix`.
pub fn is_chunk_of(key: &[u8], prefix: &[u8]) -> bool {
    key.len() > prefix.len() && key.starts_with(prefix)
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el<'a>(field: &'a [u8], value: &'a [u8]) -> Element<'a> {
        Element { field, value }
    }

    #[test]
    fn layout_matches_documented_bytes() {
        let mut out = Vec::new();
        encode(&[el(b"a", b"xy"), el(b"bc", b"")], &mut out).unwrap();
        assert_eq!(out, vec![2, 0, 1, 2, b'a', b'x', b'y', 2, 0, b'b', b'c']);
        let value = PackedValue::parse(&out).unwrap();
        assert_eq!(value.count(), 2);
        assert_eq!(value.size(), out.len());
        assert_eq!(value.find(b"a").unwrap(), Some(&b"xy"[..]));
        assert_eq!(value.find(b"bc").unwrap(), Some(&b""[..]));
        assert_eq!(value.find(b"b").unwrap(), None);
    }

    #[test]
    fn long_values_use_multi_byte_sizes() {
        let big = vec![9u8; 300];
        let mut out = Vec::new();
        encode(&[el(b"f", &big)], &mut out).unwrap();
        assert_eq!(&out[..5], &[1, 0, 1, 0xac, 0x02]);
        assert_eq!(out.len(), encoded_len(&[el(b"f", &big)]));
        assert_eq!(PackedValue::parse(&out).unwrap().find(b"f").unwrap(), Some(&big[..]));
    }

    #[test]
    fn parse_rejects_broken_values() {
        assert!(PackedValue::parse(&[1]).is_err());
        let mut out = Vec::new();
        encode(&[el(b"b", b"1"), el(b"a", b"2")], &mut out).unwrap();
        assert!(PackedValue::parse(&out).is_err());
        out.clear();
        encode(&[el(b"a", b"1")], &mut out).unwrap();
        out[0] = 2;
        assert!(PackedValue::parse(&out).is_err());
        out[0] = 1;
        out.pop();
        assert!(PackedValue::parse(&out).is_err());
    }

    #[test]
    fn split_point_balances_halves() {
        let fields: Vec<[u8; 8]> = (0..50u64).map(|i| i.to_be_bytes()).collect();
        let elements: Vec<Element<'_>> = fields.iter().map(|f| el(f, f)).collect();
        assert_eq!(split_point(&elements), Some(25));
        assert_eq!(split_point(&elements[..1]), None);
        assert_eq!(split_point(&elements[..2]), Some(1));

        let big = [0u8; 100];
        let skewed = [el(b"a", &big), el(b"b", b"1"), el(b"c", b"2"), el(b"d", b"3")];
        assert_eq!(split_point(&skewed), Some(1));
    }

    #[test]
    fn split_point_tie_keeps_extra_on_the_left() {
        // sizes 5, 5, 5: cutting after the first or second element is equally uneven
        let elements = [el(b"a", b"12"), el(b"b", b"12"), el(b"c", b"12")];
        assert_eq!(split_point(&elements), Some(2));
    }

    #[test]
    fn chunk_keys_sort_under_their_prefix() {
        let mut prefix = Vec::new();
        chunk_prefix(b"user", &mut prefix).unwrap();
        assert_eq!(prefix, b"\x00\x00\x00\x04user".to_vec());
        let mut first = prefix.clone();
        first.push(FIRST_CHUNK_MARKER);
        let mut later = prefix.clone();
        later.extend_from_slice(b"field");
        assert!(first < later);
        assert!(is_chunk_of(&first, &prefix));
        assert!(!is_chunk_of(&prefix, &prefix));
        let end = prefix_end(&prefix).unwrap();
        assert!(later < end);
        assert_eq!(prefix_end(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }
}
