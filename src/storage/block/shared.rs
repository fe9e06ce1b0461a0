//! Optimistic locking around a [`Block`].
//!
//! Every acquisition compares the change stamp observed before waiting for
//! the lock with the stamp seen once the lock is held. A mismatch means a
//! split, merge or compaction reshaped the block in between; the lock is
//! dropped and [`Retry`] tells the caller to resolve the block again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use super::Block;
use crate::types::Retry;

/// Read guard over a block that owns its reference to the lock.
pub type BlockReadGuard = ArcRwLockReadGuard<RawRwLock, Block>;
/// Write guard over a block that owns its reference to the lock.
pub type BlockWriteGuard = ArcRwLockWriteGuard<RawRwLock, Block>;

/// A block as published in the index.
pub struct SharedBlock {
    id: u64,
    stamp: Arc<AtomicU64>,
    body: Arc<RwLock<Block>>,
}

impl SharedBlock {
    /// Wraps `block` for shared access.
    pub fn new(block: Block) -> Arc<Self> {
        Arc::new(Self {
            id: block.id(),
            stamp: block.stamp_handle(),
            body: Arc::new(RwLock::new(block)),
        })
    }

    /// Identity of the wrapped block.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Change stamp readable without taking the lock.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(AtomicOrdering::Acquire)
    }

    /// Takes the read lock, failing if the stamp moved away from `seen`.
    pub fn read(&self, seen: u64) -> Result<BlockReadGuard, Retry> {
        let guard = self.body.read_arc();
        if self.stamp() != seen {
            return Err(Retry);
        }
        Ok(guard)
    }

    /// Takes the write lock, failing if the stamp moved away from `seen`.
    pub fn write(&self, seen: u64) -> Result<BlockWriteGuard, Retry> {
        let guard = self.body.write_arc();
        if self.stamp() != seen {
            return Err(Retry);
        }
        Ok(guard)
    }

    /// Takes the write lock only if it is free right now.
    pub fn try_write(&self, seen: u64) -> Result<Option<BlockWriteGuard>, Retry> {
        let Some(guard) = self.body.try_write_arc() else {
            return Ok(None);
        };
        if self.stamp() != seen {
            return Err(Retry);
        }
        Ok(Some(guard))
    }
}

impl fmt::Debug for SharedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBlock")
            .field("id", &self.id)
            .field("stamp", &self.stamp())
            .finish()
    }
}
