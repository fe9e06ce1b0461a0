//! Operations over one field of a packed value.
//!
//! Each operation locates its chunk with a floor lookup of
//! `[prefix][field]`: the greatest chunk key at or below it is the chunk whose
//! field range holds `field`. A located record outside the prefix belongs to
//! another user key and counts as no chunk at all.

use crate::storage::operation::{FoundRecord, Operation, Updates};
use crate::types::{BigMapError, Result};

use super::codec::{self, Element, PackedValue, FIRST_CHUNK_MARKER};

fn lookup_key(key: &[u8], field: &[u8]) -> Result<(Vec<u8>, usize)> {
    if field.is_empty() {
        return Err(BigMapError::Invalid("packed field must not be empty"));
    }
    let mut lookup = Vec::with_capacity(4 + key.len() + field.len());
    codec::chunk_prefix(key, &mut lookup)?;
    let prefix_len = lookup.len();
    lookup.extend_from_slice(field);
    Ok((lookup, prefix_len))
}

/// Inserts or replaces one field, splitting the chunk when it grows too large.
#[derive(Debug, Clone)]
pub struct FieldSetOp {
    key: Vec<u8>,
    prefix_len: usize,
    value: Vec<u8>,
    max_value_size: usize,
    inserted: bool,
    split: Option<(usize, usize)>,
}

impl FieldSetOp {
    /// Creates a write of `field = value` under the user key `key`.
    pub fn new(key: &[u8], field: &[u8], value: &[u8], max_value_size: usize) -> Result<Self> {
        codec::check_element(field, value)?;
        let (key, prefix_len) = lookup_key(key, field)?;
        Ok(Self {
            key,
            prefix_len,
            value: value.to_vec(),
            max_value_size,
            inserted: false,
            split: None,
        })
    }

    /// Whether the last run added a field rather than replacing one.
    pub fn inserted(&self) -> bool {
        self.inserted
    }

    /// Element counts of the left and right chunk when the last run split.
    pub fn split(&self) -> Option<(usize, usize)> {
        self.split
    }
}

impl Operation for FieldSetOp {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn floor_key(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, updates: &mut Updates) -> Result<bool> {
        let prefix = &self.key[..self.prefix_len];
        let field = &self.key[self.prefix_len..];
        let chunk = found.filter(|rec| codec::is_chunk_of(rec.key, prefix));

        let mut first_key = Vec::new();
        let (chunk_key, mut elements) = match chunk {
            Some(rec) => (rec.key, PackedValue::parse(rec.value)?.elements()?),
            None => {
                first_key.extend_from_slice(prefix);
                first_key.push(FIRST_CHUNK_MARKER);
                (first_key.as_slice(), Vec::new())
            }
        };
        let element = Element {
            field,
            value: &self.value,
        };
        let inserted = match elements.binary_search_by(|e| e.field.cmp(field)) {
            Ok(pos) => {
                elements[pos] = element;
                false
            }
            Err(pos) => {
                elements.insert(pos, element);
                true
            }
        };

        let mut split = None;
        let at = if codec::encoded_len(&elements) > self.max_value_size {
            codec::split_point(&elements)
        } else {
            None
        };
        match at {
            Some(at) => {
                let (left, right) = elements.split_at(at);
                codec::encode(left, updates.put_with(chunk_key)?)?;
                let mut right_key = Vec::with_capacity(prefix.len() + right[0].field.len());
                right_key.extend_from_slice(prefix);
                right_key.extend_from_slice(right[0].field);
                codec::encode(right, updates.put_with(&right_key)?)?;
                split = Some((left.len(), right.len()));
            }
            None => codec::encode(&elements, updates.put_with(chunk_key)?)?,
        }
        self.inserted = inserted;
        self.split = split;
        Ok(true)
    }
}

/// Reads one field.
#[derive(Debug, Clone)]
pub struct FieldGetOp {
    key: Vec<u8>,
    prefix_len: usize,
    value: Option<Vec<u8>>,
}

impl FieldGetOp {
    /// Creates a lookup of `field` under the user key `key`.
    pub fn new(key: &[u8], field: &[u8]) -> Result<Self> {
        let (key, prefix_len) = lookup_key(key, field)?;
        Ok(Self {
            key,
            prefix_len,
            value: None,
        })
    }

    /// Value observed by the last run.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Takes the value observed by the last run.
    pub fn take_value(&mut self) -> Option<Vec<u8>> {
        self.value.take()
    }
}

impl Operation for FieldGetOp {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn floor_key(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, _updates: &mut Updates) -> Result<bool> {
        let (prefix, field) = self.key.split_at(self.prefix_len);
        self.value = match found.filter(|rec| codec::is_chunk_of(rec.key, prefix)) {
            Some(rec) => PackedValue::parse(rec.value)?.find(field)?.map(<[u8]>::to_vec),
            None => None,
        };
        Ok(self.value.is_some())
    }
}

/// Removes one field; a chunk left without fields is deleted.
#[derive(Debug, Clone)]
pub struct FieldDeleteOp {
    key: Vec<u8>,
    prefix_len: usize,
    chunk_removed: bool,
}

impl FieldDeleteOp {
    /// Creates a removal of `field` under the user key `key`.
    pub fn new(key: &[u8], field: &[u8]) -> Result<Self> {
        let (key, prefix_len) = lookup_key(key, field)?;
        Ok(Self {
            key,
            prefix_len,
            chunk_removed: false,
        })
    }

    /// Whether the last run deleted the whole chunk.
    pub fn chunk_removed(&self) -> bool {
        self.chunk_removed
    }
}

impl Operation for FieldDeleteOp {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn floor_key(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, updates: &mut Updates) -> Result<bool> {
        self.chunk_removed = false;
        let (prefix, field) = self.key.split_at(self.prefix_len);
        let Some(rec) = found.filter(|rec| codec::is_chunk_of(rec.key, prefix)) else {
            return Ok(false);
        };
        let mut elements = PackedValue::parse(rec.value)?.elements()?;
        let Ok(pos) = elements.binary_search_by(|e| e.field.cmp(field)) else {
            return Ok(false);
        };
        elements.remove(pos);
        if elements.is_empty() {
            updates.delete(rec.key)?;
            self.chunk_removed = true;
        } else {
            codec::encode(&elements, updates.put_with(rec.key)?)?;
        }
        Ok(true)
    }
}
