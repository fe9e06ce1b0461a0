#![forbid(unsafe_code)]

//! Locked read-modify-write steps.
//!
//! An [`Operation`] names a key, receives the record the engine found for it
//! while the owning block is write-locked, and describes the resulting
//! physical writes in an [`Updates`] buffer. The engine applies those writes
//! before releasing the block, so readers see either none or all of them.

use crate::storage::block::MAX_VALUE_LEN;
use crate::types::{BigMapError, Result};

/// Most physical writes a single operation may request.
pub const MAX_UPDATES: usize = 2;

/// The record an operation runs against.
#[derive(Clone, Copy, Debug)]
pub struct FoundRecord<'a> {
    /// Key of the located record; differs from the operation key in floor mode.
    pub key: &'a [u8],
    /// Value bytes of the located record.
    pub value: &'a [u8],
}

/// One physical write produced by an operation.
#[derive(Clone, Debug, Default)]
pub struct Update {
    key: Vec<u8>,
    value: Vec<u8>,
    delete: bool,
}

impl Update {
    /// Target key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value to store; empty for deletes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Whether the write removes `key`.
    pub fn is_delete(&self) -> bool {
        self.delete
    }
}

/// Reusable output buffer of an operation.
#[derive(Debug, Default)]
pub struct Updates {
    slots: [Update; MAX_UPDATES],
    count: usize,
}

impl Updates {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all pending writes, keeping the allocations.
    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Number of pending writes.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no write is pending.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether any pending write stores a value.
    pub fn has_puts(&self) -> bool {
        self.iter().any(|update| !update.delete)
    }

    /// Pending writes in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &Update> + '_ {
        self.slots[..self.count].iter()
    }

    /// Pending write at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Update> {
        self.slots[..self.count].get(idx)
    }

    /// Requests that `key` be set to `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key)?.extend_from_slice(value);
        Ok(())
    }

    /// Requests a write to `key` and returns the empty value buffer to fill.
    pub fn put_with(&mut self, key: &[u8]) -> Result<&mut Vec<u8>> {
        let slot = self.next_slot(key, false)?;
        Ok(&mut slot.value)
    }

    /// Requests that `key` be removed.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.next_slot(key, true)?;
        Ok(())
    }

    fn next_slot(&mut self, key: &[u8], delete: bool) -> Result<&mut Update> {
        if self.count == MAX_UPDATES {
            return Err(BigMapError::Invalid("operation produced more than two updates"));
        }
        let slot = &mut self.slots[self.count];
        self.count += 1;
        slot.key.clear();
        slot.key.extend_from_slice(key);
        slot.value.clear();
        slot.delete = delete;
        Ok(slot)
    }
}

/// Per-worker scratch state handed to [`crate::BigSortedMap::execute`].
///
/// One context per thread; buffers are reused across calls.
#[derive(Debug, Default)]
pub struct WorkerContext {
    pub(crate) updates: Updates,
    pub(crate) key: Vec<u8>,
}

impl WorkerContext {
    /// Creates a context with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes requested by the last executed operation.
    pub fn updates(&self) -> &Updates {
        &self.updates
    }

    pub(crate) fn reset(&mut self) {
        self.updates.clear();
        self.key.clear();
    }
}

/// A read-modify-write step executed against one located record.
pub trait Operation {
    /// Key used to locate the record.
    fn key(&self) -> &[u8];

    /// Locate the greatest live record `<= key` instead of an exact match.
    fn floor_key(&self) -> bool {
        false
    }

    /// The operation never writes; the engine takes a read lock.
    fn read_only(&self) -> bool {
        false
    }

    /// Runs the step; `found` is `None` when no record matched.
    ///
    /// Returns `false` to signal a logical failure to the caller. Any updates
    /// pushed are applied only when `true` is returned.
    fn execute(&mut self, found: Option<FoundRecord<'_>>, updates: &mut Updates) -> Result<bool>;
}

/// Copies out the value stored under a key.
#[derive(Debug, Clone)]
pub struct GetOp {
    key: Vec<u8>,
    value: Vec<u8>,
    found: bool,
}

impl GetOp {
    /// Creates a lookup of `key`.
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: Vec::new(),
            found: false,
        }
    }

    /// Value observed by the last run, if the key existed.
    pub fn value(&self) -> Option<&[u8]> {
        self.found.then_some(self.value.as_slice())
    }
}

impl Operation for GetOp {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn read_only(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, _updates: &mut Updates) -> Result<bool> {
        self.value.clear();
        self.found = found.is_some();
        if let Some(record) = found {
            self.value.extend_from_slice(record.value);
        }
        Ok(self.found)
    }
}

/// Adds a signed delta to a counter stored as ASCII decimal.
///
/// A missing key counts as zero.
#[derive(Debug, Clone)]
pub struct IncrementOp {
    key: Vec<u8>,
    delta: i64,
    result: i64,
}

impl IncrementOp {
    /// Creates an increment of `key` by `delta`.
    pub fn new(key: &[u8], delta: i64) -> Self {
        Self {
            key: key.to_vec(),
            delta,
            result: 0,
        }
    }

    /// Counter value after the last successful run.
    pub fn result(&self) -> i64 {
        self.result
    }
}

fn parse_counter(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(BigMapError::Invalid("value is not an integer"))
}

impl Operation for IncrementOp {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, updates: &mut Updates) -> Result<bool> {
        let current = match found {
            Some(record) => parse_counter(record.value)?,
            None => 0,
        };
        let next = current
            .checked_add(self.delta)
            .ok_or(BigMapError::Invalid("increment would overflow"))?;
        updates.put(&self.key, next.to_string().as_bytes())?;
        self.result = next;
        Ok(true)
    }
}

/// Appends bytes to the value stored under a key, creating it if missing.
#[derive(Debug, Clone)]
pub struct AppendOp {
    key: Vec<u8>,
    suffix: Vec<u8>,
    new_len: usize,
}

impl AppendOp {
    /// Creates an append of `suffix` to `key`.
    pub fn new(key: &[u8], suffix: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            suffix: suffix.to_vec(),
            new_len: 0,
        }
    }

    /// Length of the value after the last successful run.
    pub fn new_len(&self) -> usize {
        self.new_len
    }
}

impl Operation for AppendOp {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, updates: &mut Updates) -> Result<bool> {
        let current = found.map_or(&[][..], |record| record.value);
        let new_len = current.len() + self.suffix.len();
        if new_len > MAX_VALUE_LEN {
            return Ok(false);
        }
        let buf = updates.put_with(&self.key)?;
        buf.extend_from_slice(current);
        buf.extend_from_slice(&self.suffix);
        self.new_len = new_len;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_hold_at_most_two_writes() {
        let mut updates = Updates::new();
        updates.put(b"a", b"1").unwrap();
        updates.delete(b"b").unwrap();
        assert!(updates.put(b"c", b"3").is_err());
        assert_eq!(updates.len(), 2);
        assert!(updates.has_puts());
        let second = updates.get(1).unwrap();
        assert!(second.is_delete());
        assert_eq!(second.key(), b"b");
        updates.clear();
        assert!(updates.is_empty());
        updates.delete(b"x").unwrap();
        assert!(!updates.has_puts());
        assert_eq!(updates.get(0).unwrap().value(), b"");
    }

    #[test]
    fn increment_treats_missing_as_zero() {
        let mut op = IncrementOp::new(b"n", 5);
        let mut updates = Updates::new();
        assert!(op.execute(None, &mut updates).unwrap());
        assert_eq!(op.result(), 5);
        assert_eq!(updates.get(0).unwrap().value(), b"5");

        updates.clear();
        let found = FoundRecord { key: b"n", value: b"-7" };
        op.execute(Some(found), &mut updates).unwrap();
        assert_eq!(op.result(), -2);
    }

    #[test]
    fn increment_rejects_garbage_and_overflow() {
        let mut updates = Updates::new();
        let found = FoundRecord { key: b"n", value: b"abc" };
        assert!(IncrementOp::new(b"n", 1).execute(Some(found), &mut updates).is_err());
        let max = i64::MAX.to_string();
        let found = FoundRecord { key: b"n", value: max.as_bytes() };
        assert!(IncrementOp::new(b"n", 1).execute(Some(found), &mut updates).is_err());
        assert!(updates.is_empty());
    }

    #[test]
    fn append_concatenates() {
        let mut op = AppendOp::new(b"s", b"world");
        let mut updates = Updates::new();
        let found = FoundRecord { key: b"s", value: b"hello " };
        assert!(op.execute(Some(found), &mut updates).unwrap());
        assert_eq!(updates.get(0).unwrap().value(), b"hello world");
        assert_eq!(op.new_len(), 11);
    }

    #[test]
    fn get_reports_absence() {
        let mut op = GetOp::new(b"k");
        let mut updates = Updates::new();
        assert!(!op.execute(None, &mut updates).unwrap());
        assert_eq!(op.value(), None);
        let found = FoundRecord { key: b"k", value: b"v" };
        assert!(op.execute(Some(found), &mut updates).unwrap());
        assert_eq!(op.value(), Some(&b"v"[..]));
    }
}
