#![forbid(unsafe_code)]

//! Read/write locks over logical keys.
//!
//! Keys hash onto a prime-sized table of shards. Locking several keys goes
//! through [`KeysLocker::lock_order`], which sorts and deduplicates the shards
//! so every caller acquires them in the same ascending sequence.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;
use xxhash_rust::xxh64::xxh64;

/// Shard count used by [`KeysLocker::default`].
pub const DEFAULT_SHARDS: usize = 4099;

/// Guard over a single shard taken for reading.
pub type KeyReadGuard<'a> = RwLockReadGuard<'a, ()>;
/// Guard over a single shard taken for writing.
pub type KeyWriteGuard<'a> = RwLockWriteGuard<'a, ()>;

/// Shards held by one multi-key read lock, released together on drop.
#[must_use = "the keys are unlocked as soon as the guard is dropped"]
pub struct KeysReadGuard<'a> {
    guards: SmallVec<[KeyReadGuard<'a>; 4]>,
}

/// Shards held by one multi-key write lock, released together on drop.
#[must_use = "the keys are unlocked as soon as the guard is dropped"]
pub struct KeysWriteGuard<'a> {
    guards: SmallVec<[KeyWriteGuard<'a>; 4]>,
}

impl KeysReadGuard<'_> {
    /// Number of distinct shards held.
    pub fn shards(&self) -> usize {
        self.guards.len()
    }
}

impl KeysWriteGuard<'_> {
    /// Number of distinct shards held.
    pub fn shards(&self) -> usize {
        self.guards.len()
    }
}

/// Sharded lock table for logical keys.
pub struct KeysLocker {
    shards: Box<[RwLock<()>]>,
}

impl Default for KeysLocker {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl KeysLocker {
    /// Creates a table with at least `size` shards, rounded up to a prime.
    pub fn new(size: usize) -> Self {
        let size = next_prime(size.max(2));
        let shards = (0..size).map(|_| RwLock::new(())).collect();
        tracing::debug!(target: "bigmap::locker", shards = size, "created keys locker");
        Self { shards }
    }

    /// Number of shards in the table.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard guarding `key`.
    pub fn shard_of(&self, key: &[u8]) -> usize {
        (xxh64(key, 0) % self.shards.len() as u64) as usize
    }

    /// Locks `key` for reading.
    pub fn read_lock(&self, key: &[u8]) -> KeyReadGuard<'_> {
        self.shards[self.shard_of(key)].read()
    }

    /// Locks `key` for writing.
    pub fn write_lock(&self, key: &[u8]) -> KeyWriteGuard<'_> {
        self.shards[self.shard_of(key)].write()
    }

    /// Distinct shards guarding `keys`, in the order they are acquired.
    ///
    /// Keys are sorted before hashing so that the result depends only on the
    /// key set, never on the order the caller listed it in.
    pub fn lock_order<K: AsRef<[u8]>>(&self, keys: &[K]) -> SmallVec<[usize; 8]> {
        let mut sorted: SmallVec<[&[u8]; 8]> = keys.iter().map(|key| key.as_ref()).collect();
        sorted.sort_unstable();
        let mut order: SmallVec<[usize; 8]> =
            sorted.into_iter().map(|key| self.shard_of(key)).collect();
        order.sort_unstable();
        order.dedup();
        order
    }

    /// Locks every key of `keys` for reading.
    pub fn read_lock_all_keys<K: AsRef<[u8]>>(&self, keys: &[K]) -> KeysReadGuard<'_> {
        let order = self.lock_order(keys);
        tracing::trace!(target: "bigmap::locker", shards = order.len(), "read locking keys");
        KeysReadGuard {
            guards: order.into_iter().map(|shard| self.shards[shard].read()).collect(),
        }
    }

    /// Locks every key of `keys` for writing.
    pub fn write_lock_all_keys<K: AsRef<[u8]>>(&self, keys: &[K]) -> KeysWriteGuard<'_> {
        let order = self.lock_order(keys);
        tracing::trace!(target: "bigmap::locker", shards = order.len(), "write locking keys");
        KeysWriteGuard {
            guards: order.into_iter().map(|shard| self.shards[shard].write()).collect(),
        }
    }

    /// Locks the keys of `pairs` for writing; the values are ignored.
    pub fn write_lock_all_key_values<K, V>(&self, pairs: &[(K, V)]) -> KeysWriteGuard<'_>
    where
        K: AsRef<[u8]>,
    {
        let keys: SmallVec<[&[u8]; 8]> = pairs.iter().map(|(key, _)| key.as_ref()).collect();
        self.write_lock_all_keys(&keys)
    }
}

impl std::fmt::Debug for KeysLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysLocker")
            .field("shards", &self.shards.len())
            .finish()
    }
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

fn next_prime(mut n: usize) -> usize {
    while !is_prime(n) {
        n += 1;
    }
    n
}
