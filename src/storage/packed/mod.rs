#![forbid(unsafe_code)]

//! Hash-like collections stored as sorted multi-field values.
//!
//! All fields of one user key live in one or more chunk records that sort
//! together under the key's length-prefixed chunk prefix. Writes go through
//! the field operations in [`ops`], so a chunk is rewritten while its block
//! stays locked; a chunk that outgrows [`PackedOptions::max_value_size`]
//! splits into two records in the same step.
//!
//! A split may put its right half into another block, which the engine
//! applies only after the first block is released. [`PackedMap`] therefore
//! serialises access per user key with a [`KeysLocker`].

pub mod codec;
pub mod ops;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::primitives::concurrency::KeysLocker;
use crate::storage::engine::BigSortedMap;
use crate::storage::operation::WorkerContext;
use crate::types::{BigMapError, Result};

pub use codec::{Element, PackedValue};
pub use ops::{FieldDeleteOp, FieldGetOp, FieldSetOp};

/// Options for [`PackedMap`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackedOptions {
    /// Encoded size above which a chunk is split in two.
    pub max_value_size: usize,
}

impl Default for PackedOptions {
    fn default() -> Self {
        Self { max_value_size: 512 }
    }
}

impl PackedOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the split threshold.
    pub fn max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    /// Checks that the threshold leaves room for at least one element.
    pub fn validate(&self) -> Result<()> {
        if self.max_value_size < codec::COUNT_LEN + 3 {
            return Err(BigMapError::Config(format!(
                "max_value_size {} cannot hold a single field",
                self.max_value_size
            )));
        }
        Ok(())
    }
}

/// What [`PackedMap::set`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetOutcome {
    /// The field was new.
    Inserted,
    /// An existing field got a new value.
    Replaced,
    /// The engine refused the write (memory ceiling or oversized chunk).
    Refused,
}

/// Field-level access to packed values stored in a [`BigSortedMap`].
pub struct PackedMap {
    engine: Arc<BigSortedMap>,
    locker: Arc<KeysLocker>,
    options: PackedOptions,
    splits: AtomicU64,
}

impl PackedMap {
    /// Wraps `engine`, locking user keys through `locker`.
    pub fn new(
        engine: Arc<BigSortedMap>,
        locker: Arc<KeysLocker>,
        options: PackedOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            engine,
            locker,
            options,
            splits: AtomicU64::new(0),
        })
    }

    /// Underlying engine.
    pub fn engine(&self) -> &Arc<BigSortedMap> {
        &self.engine
    }

    /// Sets `field` of `key` to `value`.
    pub fn set(
        &self,
        ctx: &mut WorkerContext,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<SetOutcome> {
        let mut op = FieldSetOp::new(key, field, value, self.options.max_value_size)?;
        let _guard = self.locker.write_lock(key);
        if !self.engine.execute(&mut op, ctx)? {
            return Ok(SetOutcome::Refused);
        }
        if let Some((left, right)) = op.split() {
            self.splits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                target: "bigmap::packed",
                key_len = key.len(),
                left,
                right,
                "split packed value"
            );
        }
        Ok(if op.inserted() {
            SetOutcome::Inserted
        } else {
            SetOutcome::Replaced
        })
    }

    /// Value of `field` of `key`.
    pub fn get(&self, ctx: &mut WorkerContext, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut op = FieldGetOp::new(key, field)?;
        let _guard = self.locker.read_lock(key);
        self.engine.execute(&mut op, ctx)?;
        Ok(op.take_value())
    }

    /// Removes `field` of `key`; returns whether it existed.
    pub fn delete(&self, ctx: &mut WorkerContext, key: &[u8], field: &[u8]) -> Result<bool> {
        let mut op = FieldDeleteOp::new(key, field)?;
        let _guard = self.locker.write_lock(key);
        let deleted = self.engine.execute(&mut op, ctx)?;
        if op.chunk_removed() {
            tracing::trace!(target: "bigmap::packed", key_len = key.len(), "dropped empty chunk");
        }
        Ok(deleted)
    }

    /// Number of fields stored under `key`.
    pub fn len(&self, key: &[u8]) -> Result<u64> {
        let mut total = 0u64;
        self.for_each_chunk(key, |_, value| {
            total += value.count() as u64;
            Ok(())
        })?;
        Ok(total)
    }

    /// Fields stored under `key`, in order.
    pub fn fields(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut fields = Vec::new();
        self.for_each_chunk(key, |_, value| {
            for element in value.iter() {
                fields.push(element?.field.to_vec());
            }
            Ok(())
        })?;
        Ok(fields)
    }

    /// Physical keys of the chunks holding `key`, in order.
    pub fn chunk_keys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.for_each_chunk(key, |chunk, _| {
            keys.push(chunk.to_vec());
            Ok(())
        })?;
        Ok(keys)
    }

    /// Chunk splits performed through this map.
    pub fn splits(&self) -> u64 {
        self.splits.load(Ordering::Relaxed)
    }

    fn for_each_chunk<F>(&self, key: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], PackedValue<'_>) -> Result<()>,
    {
        let mut prefix = Vec::new();
        codec::chunk_prefix(key, &mut prefix)?;
        let end = codec::prefix_end(&prefix);
        let _guard = self.locker.read_lock(key);
        let Some(mut scanner) = self.engine.scanner(Some(&prefix), end.as_deref(), false)? else {
            return Ok(());
        };
        while let Some((chunk, raw)) = scanner.next()? {
            if codec::is_chunk_of(&chunk, &prefix) {
                visit(&chunk, PackedValue::parse(&raw)?)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PackedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedMap")
            .field("options", &self.options)
            .field("splits", &self.splits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::options::EngineOptions;

    fn packed(max_value_size: usize) -> PackedMap {
        let engine = Arc::new(BigSortedMap::open(EngineOptions::new()).unwrap());
        PackedMap::new(
            engine,
            Arc::new(KeysLocker::new(31)),
            PackedOptions::new().max_value_size(max_value_size),
        )
        .unwrap()
    }

    #[test]
    fn set_get_delete_fields() -> Result<()> {
        let map = packed(512);
        let mut ctx = WorkerContext::new();
        assert_eq!(map.set(&mut ctx, b"user:1", b"name", b"ann")?, SetOutcome::Inserted);
        assert_eq!(map.set(&mut ctx, b"user:1", b"age", b"33")?, SetOutcome::Inserted);
        assert_eq!(map.set(&mut ctx, b"user:1", b"name", b"bo")?, SetOutcome::Replaced);
        assert_eq!(map.get(&mut ctx, b"user:1", b"name")?, Some(b"bo".to_vec()));
        assert_eq!(map.get(&mut ctx, b"user:1", b"city")?, None);
        assert_eq!(map.get(&mut ctx, b"user:2", b"name")?, None);
        assert_eq!(map.len(b"user:1")?, 2);
        assert_eq!(map.fields(b"user:1")?, vec![b"age".to_vec(), b"name".to_vec()]);

        assert!(map.delete(&mut ctx, b"user:1", b"age")?);
        assert!(!map.delete(&mut ctx, b"user:1", b"age")?);
        assert!(map.delete(&mut ctx, b"user:1", b"name")?);
        assert_eq!(map.len(b"user:1")?, 0);
        assert!(map.chunk_keys(b"user:1")?.is_empty());
        Ok(())
    }

    #[test]
    fn neighbouring_keys_stay_apart() -> Result<()> {
        let map = packed(512);
        let mut ctx = WorkerContext::new();
        map.set(&mut ctx, b"a", b"f", b"1")?;
        map.set(&mut ctx, b"ab", b"f", b"2")?;
        map.set(&mut ctx, b"b", b"f", b"3")?;
        assert_eq!(map.get(&mut ctx, b"a", b"f")?, Some(b"1".to_vec()));
        assert_eq!(map.get(&mut ctx, b"ab", b"f")?, Some(b"2".to_vec()));
        assert_eq!(map.len(b"a")?, 1);
        assert_eq!(map.len(b"b")?, 1);
        assert_eq!(map.chunk_keys(b"ab")?.len(), 1);
        Ok(())
    }

    #[test]
    fn growing_value_splits_and_stays_readable() -> Result<()> {
        let map = packed(128);
        let mut ctx = WorkerContext::new();
        for i in 0..100u32 {
            map.set(&mut ctx, b"big", &i.to_be_bytes(), &[i as u8; 6])?;
        }
        assert!(map.splits() > 0);
        assert!(map.chunk_keys(b"big")?.len() > 1);
        assert_eq!(map.len(b"big")?, 100);
        let expected: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(map.fields(b"big")?, expected);
        for i in 0..100u32 {
            assert_eq!(map.get(&mut ctx, b"big", &i.to_be_bytes())?, Some(vec![i as u8; 6]));
        }
        for i in (0..100u32).step_by(2) {
            assert!(map.delete(&mut ctx, b"big", &i.to_be_bytes())?);
        }
        assert_eq!(map.len(b"big")?, 50);
        map.engine().verify()?;
        Ok(())
    }

    #[test]
    fn options_reject_tiny_threshold() {
        assert!(PackedOptions::new().max_value_size(2).validate().is_err());
        let parsed: PackedOptions = toml::from_str("max_value_size = 1024").unwrap();
        assert_eq!(parsed.max_value_size, 1024);
    }
}
