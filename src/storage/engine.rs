#![forbid(unsafe_code)]

//! The ordered map composed of the block index and its blocks.
//!
//! Every access resolves the block responsible for a key from the lock-free
//! index, locks it, and then checks that the index still names the same block
//! under the same anchor. A changed stamp or a moved anchor sends the caller
//! back to the index; [`Retry`] never leaves this module.
//!
//! While a block is write-locked its key range `[anchor, next anchor)` is
//! stable: only the holder of a block's lock may move its anchor, and new
//! anchors inside a range are only ever published by a split of the block
//! owning that range.

use std::ops::Deref;
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::primitives::arena::MemoryArena;
use crate::storage::block::{
    self, Block, BlockConfig, BlockReadGuard, BlockWriteGuard, PutOutcome, SharedBlock, MAX_KEY_LEN,
    MAX_VALUE_LEN,
};
use crate::storage::index::{BlockIndex, IndexEntry};
use crate::storage::operation::{FoundRecord, Operation, Updates, WorkerContext};
use crate::storage::options::EngineOptions;
use crate::storage::scanner::Scanner;
use crate::storage::stats::{EngineStats, EngineStatsSnapshot};
use crate::types::{BigMapError, Result, Retry};

/// A block that was locked and confirmed to still be published.
pub(crate) struct Located<G> {
    pub(crate) entry: IndexEntry,
    pub(crate) guard: G,
    /// Offset of the record an operation runs against, if any.
    pub(crate) found: Option<usize>,
}

struct Held {
    anchor: Vec<u8>,
    /// Anchor of the next block when this one was locked; `None` at the right edge.
    upper: Option<Vec<u8>>,
    block: Arc<SharedBlock>,
    guard: BlockWriteGuard,
}

impl Held {
    fn covers(&self, key: &[u8]) -> bool {
        key >= self.anchor.as_slice() && self.upper.as_deref().map_or(true, |upper| key < upper)
    }
}

/// Write-locked blocks in anchor order.
///
/// Starts with the block an access located. Splits performed while applying
/// writes add their new siblings here, still locked, and an operation whose
/// updates reach past that block adds the blocks owning them.
struct WriteSet {
    held: SmallVec<[Held; 2]>,
}

impl WriteSet {
    fn covers(&self, key: &[u8]) -> bool {
        self.position(key).is_some()
    }

    fn position(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .held
            .iter()
            .rposition(|held| held.anchor.as_slice() <= key)?;
        self.held[idx].covers(key).then_some(idx)
    }

    fn target(&self, key: &[u8]) -> Result<usize> {
        self.position(key)
            .ok_or_else(|| corrupt("write outside the locked blocks"))
    }

    /// Whether `key` lies past the range of every held block.
    fn right_of_all(&self, key: &[u8]) -> bool {
        self.held.last().is_some_and(|held| {
            held.upper
                .as_deref()
                .is_some_and(|upper| key >= upper)
        })
    }

    fn insert(&mut self, held: Held) {
        let idx = self.held.partition_point(|h| h.anchor < held.anchor);
        self.held.insert(idx, held);
    }
}

/// Integrity summary produced by [`BigSortedMap::verify`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VerifyReport {
    /// Blocks visited.
    pub blocks: usize,
    /// Physical records, tombstones included.
    pub records: usize,
    /// Live records.
    pub live_records: usize,
    /// Tombstoned records.
    pub tombstones: usize,
    /// Bytes occupied by records.
    pub used_bytes: usize,
    /// Bytes occupied by live records only.
    pub live_bytes: usize,
    /// Sum of block capacities.
    pub capacity_bytes: usize,
}

/// Concurrent ordered key-value map over arena-backed blocks.
pub struct BigSortedMap {
    options: EngineOptions,
    config: BlockConfig,
    arena: Arc<MemoryArena>,
    stats: Arc<EngineStats>,
    index: BlockIndex,
}

impl BigSortedMap {
    /// Opens an empty map.
    pub fn open(options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let config = BlockConfig {
            ladder: options.ladder(),
            compaction_ratio: options.compaction_ratio,
            merge_ratio: options.merge_ratio,
        };
        let arena = MemoryArena::new(options.track_allocations);
        let stats = Arc::new(EngineStats::default());
        let root = Block::new(
            arena.allocate(options.initial_block_size),
            config,
            Some(Arc::clone(&stats)),
        );
        stats.add_blocks(1);
        let index = BlockIndex::new(SharedBlock::new(root));
        tracing::debug!(
            target: "bigmap::engine",
            max_block_size = options.max_block_size,
            initial_block_size = options.initial_block_size,
            max_memory = ?options.max_memory,
            "opened engine"
        );
        Ok(Self {
            options,
            config,
            arena,
            stats,
            index,
        })
    }

    /// Options the map was opened with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Stores `value` under `key`.
    ///
    /// Returns `false` when the memory ceiling is reached or the record can
    /// never fit in a block.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.admit(key, value)? || self.refuse_write() {
            return Ok(false);
        }
        let located = self.locate_write(key)?;
        let mut set = self.write_set(located);
        self.write_in(&mut set, key, value)?;
        Ok(true)
    }

    /// Copies the value of `key` into `out` and returns its length.
    ///
    /// When the value is longer than `out` nothing is copied; the returned
    /// length tells the caller how large a buffer to retry with.
    pub fn get(&self, key: &[u8], out: &mut [u8]) -> Result<Option<usize>> {
        check_key(key)?;
        let located = self.locate_read(key)?;
        match located.guard.get(key)? {
            Some(value) => {
                if value.len() <= out.len() {
                    out[..value.len()].copy_from_slice(value);
                }
                Ok(Some(value.len()))
            }
            None => Ok(None),
        }
    }

    /// Returns an owned copy of the value of `key`.
    pub fn get_vec(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let located = self.locate_read(key)?;
        Ok(located.guard.get(key)?.map(<[u8]>::to_vec))
    }

    /// Whether a live record is stored under `key`.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        let located = self.locate_read(key)?;
        Ok(located.guard.find(key)?.is_some())
    }

    /// Removes `key`; returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        let located = self.locate_write(key)?;
        let mut set = self.write_set(located);
        let deleted = self.delete_in(&mut set, key)?;
        let candidates = self.release(set, deleted);
        self.merge_candidates(&candidates)?;
        Ok(deleted)
    }

    /// Runs `op` against the record it locates.
    ///
    /// The located block stays locked while the operation runs. Before any
    /// update is applied, every block owning an update key is write-locked
    /// too, so either all updates land or none do. Returns the operation's
    /// own verdict, or `false` when the memory ceiling refused the writes.
    pub fn execute<O>(&self, op: &mut O, ctx: &mut WorkerContext) -> Result<bool>
    where
        O: Operation + ?Sized,
    {
        ctx.reset();
        ctx.key.extend_from_slice(op.key());
        check_key(&ctx.key)?;
        if op.read_only() {
            self.execute_read(op, ctx)
        } else {
            self.execute_write(op, ctx)
        }
    }

    /// Opens a cursor over `[start, stop)`; `None` bounds are open.
    ///
    /// Returns `None` when the range holds no live record.
    pub fn scanner(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Option<Scanner<'_>>> {
        Scanner::open(self, start, stop, reverse)
    }

    /// Removes every live record in `[start, stop)` and returns how many.
    pub fn delete_range(&self, start: Option<&[u8]>, stop: Option<&[u8]>) -> Result<u64> {
        let Some(mut scanner) = self.scanner(start, stop, false)? else {
            return Ok(0);
        };
        let mut keys = Vec::new();
        while let Some((key, _)) = scanner.next()? {
            keys.push(key);
        }
        drop(scanner);
        let mut removed = 0;
        for key in keys {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        tracing::debug!(target: "bigmap::engine", removed, "deleted range");
        Ok(removed)
    }

    /// Number of live records, counted block by block.
    pub fn len(&self) -> Result<u64> {
        let mut total = 0u64;
        self.walk(SharedBlock::read, |_, block| {
            total += block.live_count() as u64;
            Ok(())
        })?;
        Ok(total)
    }

    /// Whether the map holds no live record.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of blocks currently published.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Sum of the used bytes of all blocks, tombstones included.
    pub fn total_used_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        self.walk(SharedBlock::read, |_, block| {
            total += block.used_bytes() as u64;
            Ok(())
        })?;
        Ok(total)
    }

    /// Force-compacts every block; returns how many blocks shrank.
    pub fn compact_all(&self) -> Result<usize> {
        let mut compacted = 0;
        self.walk(SharedBlock::write, |_, block| {
            if block.compact(true)? {
                compacted += 1;
            }
            Ok(())
        })?;
        tracing::debug!(target: "bigmap::engine", compacted, "compacted all blocks");
        Ok(compacted)
    }

    /// Walks every block checking ordering, anchors and byte accounting.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut prev_last: Option<Vec<u8>> = None;
        self.walk(SharedBlock::read, |entry, block| {
            if !block.is_valid() {
                return Err(corrupt("published block was merged away"));
            }
            if block.used_bytes() > block.capacity() {
                return Err(corrupt("block used bytes exceed capacity"));
            }
            let mut bytes = 0;
            let mut records = 0;
            let mut deleted = 0;
            let mut last: Option<&[u8]> = None;
            for rec in block.records() {
                let rec = rec?;
                if last.is_some_and(|prev| prev >= rec.key) {
                    return Err(corrupt("records out of order within block"));
                }
                if last.is_none() {
                    if !entry.anchor.is_empty() && rec.key != entry.anchor.as_slice() {
                        return Err(corrupt("block anchor differs from first key"));
                    }
                    if prev_last.as_deref().is_some_and(|prev| prev >= rec.key) {
                        return Err(corrupt("blocks overlap"));
                    }
                }
                bytes += rec.end() - rec.offset;
                records += 1;
                deleted += usize::from(rec.deleted);
                last = Some(rec.key);
            }
            if records == 0 && !entry.anchor.is_empty() {
                return Err(corrupt("empty block away from the left edge"));
            }
            if bytes != block.used_bytes()
                || records != block.record_count()
                || deleted != block.deleted_count()
            {
                return Err(corrupt("block counters disagree with its records"));
            }
            if let Some(last) = last {
                prev_last = Some(last.to_vec());
            }
            report.blocks += 1;
            report.records += records;
            report.live_records += records - deleted;
            report.tombstones += deleted;
            report.used_bytes += bytes;
            report.live_bytes += block.live_bytes()?;
            report.capacity_bytes += block.capacity();
            Ok(())
        })?;
        Ok(report)
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot(self.arena.allocated_bytes())
    }

    /// Bytes currently allocated from the arena.
    pub fn memory_allocated(&self) -> u64 {
        self.arena.allocated_bytes()
    }

    /// Resolves and locks the block chosen by `locate`.
    ///
    /// Returns `None` when `locate` finds nothing. Loops until the block it
    /// locked is still the one `locate` picks.
    pub(crate) fn resolve<G, L, F>(&self, locate: L, lock: F) -> Option<Located<G>>
    where
        L: Fn(&BlockIndex) -> Option<IndexEntry>,
        F: Fn(&SharedBlock, u64) -> std::result::Result<G, Retry>,
    {
        loop {
            let entry = locate(&self.index)?;
            let seen = entry.block.stamp();
            let guard = match lock(&entry.block, seen) {
                Ok(guard) => guard,
                Err(Retry) => {
                    self.note_retry(&entry);
                    continue;
                }
            };
            match locate(&self.index) {
                Some(current) if current.same_block(&entry) => {
                    return Some(Located {
                        entry,
                        guard,
                        found: None,
                    })
                }
                _ => {
                    drop(guard);
                    self.note_retry(&entry);
                }
            }
        }
    }

    pub(crate) fn index(&self) -> &BlockIndex {
        &self.index
    }

    fn note_retry(&self, entry: &IndexEntry) {
        self.stats.inc_retries();
        tracing::trace!(
            target: "bigmap::engine",
            block = entry.block.id(),
            "block changed before lock, retrying"
        );
    }

    fn locate_read(&self, key: &[u8]) -> Result<Located<BlockReadGuard>> {
        self.resolve(|index| index.floor(key), SharedBlock::read)
            .ok_or_else(|| corrupt("index has no block at or below key"))
    }

    fn locate_write(&self, key: &[u8]) -> Result<Located<BlockWriteGuard>> {
        self.resolve(|index| index.floor(key), SharedBlock::write)
            .ok_or_else(|| corrupt("index has no block at or below key"))
    }

    /// Locates the record an operation runs against.
    ///
    /// In floor mode a block without a live record `<= key` hands over to
    /// the block before it, so the search may walk left across blocks.
    fn locate_record<G, F>(&self, key: &[u8], floor: bool, lock: F) -> Result<Located<G>>
    where
        G: Deref<Target = Block>,
        F: Fn(&SharedBlock, u64) -> std::result::Result<G, Retry>,
    {
        let mut before: Option<Vec<u8>> = None;
        loop {
            let located = match &before {
                None => self
                    .resolve(|index| index.floor(key), &lock)
                    .ok_or_else(|| corrupt("index has no block at or below key"))?,
                Some(anchor) => match self.resolve(|index| index.lower(anchor), &lock) {
                    Some(located) => located,
                    None => {
                        before = None;
                        continue;
                    }
                },
            };
            let found = if floor {
                located.guard.floor(key)?.map(|rec| rec.offset)
            } else {
                located.guard.find(key)?
            };
            if found.is_none() && floor && !located.entry.anchor.is_empty() {
                before = Some(located.entry.anchor.clone());
                continue;
            }
            return Ok(Located { found, ..located });
        }
    }

    fn execute_read<O>(&self, op: &mut O, ctx: &mut WorkerContext) -> Result<bool>
    where
        O: Operation + ?Sized,
    {
        let WorkerContext { updates, key, .. } = ctx;
        let located = self.locate_record(key, op.floor_key(), SharedBlock::read)?;
        let ok = run_operation(op, &located, updates)?;
        if !updates.is_empty() {
            return Err(BigMapError::Invalid("read-only operation requested writes"));
        }
        Ok(ok)
    }

    fn execute_write<O>(&self, op: &mut O, ctx: &mut WorkerContext) -> Result<bool>
    where
        O: Operation + ?Sized,
    {
        let WorkerContext { updates, key, .. } = ctx;
        loop {
            updates.clear();
            let located = self.locate_record(key, op.floor_key(), SharedBlock::write)?;
            let ok = run_operation(op, &located, updates)?;
            if !ok || updates.is_empty() {
                return Ok(ok);
            }
            for update in updates.iter().filter(|update| !update.is_delete()) {
                if !self.admit(update.key(), update.value())? {
                    return Ok(false);
                }
            }
            if updates.has_puts() && self.refuse_write() {
                return Ok(false);
            }

            let mut set = self.write_set(located);
            if !self.extend_set(&mut set, updates)? {
                drop(set);
                self.stats.inc_retries();
                tracing::trace!(
                    target: "bigmap::engine",
                    "block left of the write set is busy, rerunning operation"
                );
                continue;
            }
            let mut deleted = false;
            for update in updates.iter() {
                if update.is_delete() {
                    deleted |= self.delete_in(&mut set, update.key())?;
                } else {
                    self.write_in(&mut set, update.key(), update.value())?;
                }
            }
            let candidates = self.release(set, deleted);
            self.merge_candidates(&candidates)?;
            return Ok(true);
        }
    }

    /// Write-locks the blocks owning update keys that `set` does not cover.
    ///
    /// Blocks right of everything held are waited for, matching the left to
    /// right order merges lock in. Any other block is only tried; `false`
    /// means it was busy and the caller has to release `set` and start over.
    fn extend_set(&self, set: &mut WriteSet, updates: &Updates) -> Result<bool> {
        for update in updates.iter() {
            let key = update.key();
            if set.covers(key) {
                continue;
            }
            let located = if set.right_of_all(key) {
                self.locate_write(key)?
            } else {
                match self.try_locate_write(key) {
                    Some(located) => located,
                    None => return Ok(false),
                }
            };
            set.insert(self.hold(located));
        }
        Ok(true)
    }

    /// Locks the block owning `key` only if that needs no waiting.
    fn try_locate_write(&self, key: &[u8]) -> Option<Located<BlockWriteGuard>> {
        let entry = self.index.floor(key)?;
        let guard = entry.block.try_write(entry.block.stamp()).ok()??;
        let current = self.index.floor(key)?;
        current.same_block(&entry).then_some(Located {
            entry,
            guard,
            found: None,
        })
    }

    /// Validates a record; `false` means it can never be stored.
    fn admit(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        check_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(BigMapError::Invalid("value longer than 65535 bytes"));
        }
        if !block::fits_block(key.len(), value.len(), self.config.ladder.max()) {
            tracing::debug!(
                target: "bigmap::engine",
                key_len = key.len(),
                value_len = value.len(),
                "record larger than a block, refusing write"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn refuse_write(&self) -> bool {
        let Some(limit) = self.options.max_memory else {
            return false;
        };
        let allocated = self.arena.allocated_bytes();
        if allocated < limit {
            return false;
        }
        self.stats.inc_rejected_writes();
        tracing::debug!(
            target: "bigmap::engine",
            allocated,
            limit,
            "memory ceiling reached, refusing write"
        );
        true
    }

    fn write_set(&self, located: Located<BlockWriteGuard>) -> WriteSet {
        WriteSet {
            held: smallvec![self.hold(located)],
        }
    }

    fn hold(&self, located: Located<BlockWriteGuard>) -> Held {
        let upper = self.index.higher(&located.entry.anchor).map(|entry| entry.anchor);
        Held {
            anchor: located.entry.anchor,
            upper,
            block: located.entry.block,
            guard: located.guard,
        }
    }

    fn write_in(&self, set: &mut WriteSet, key: &[u8], value: &[u8]) -> Result<()> {
        loop {
            let idx = set.target(key)?;
            match set.held[idx].guard.put(key, value)? {
                PutOutcome::Done => return Ok(()),
                PutOutcome::NeedsSplit => self.split_held(set, idx, key)?,
            }
        }
    }

    fn delete_in(&self, set: &mut WriteSet, key: &[u8]) -> Result<bool> {
        let idx = set.target(key)?;
        let guard = &mut set.held[idx].guard;
        let deleted = guard.delete(key)?;
        if deleted {
            guard.compact(false)?;
        }
        Ok(deleted)
    }

    /// Makes room for `key` next to the held block at `idx`.
    ///
    /// The lower half moves to a new sibling published under the old anchor
    /// and the block is re-anchored at its new first key. A block holding a
    /// single record cannot split; `key` then gets a fresh block of its own
    /// on the appropriate side.
    fn split_held(&self, set: &mut WriteSet, idx: usize, key: &[u8]) -> Result<()> {
        let held = &mut set.held[idx];
        if let Some(lower) = held.guard.split(false)? {
            let new_anchor = held
                .guard
                .first_key()?
                .ok_or_else(|| corrupt("split left an empty block"))?
                .to_vec();
            let (block, guard) = self.adopt(lower)?;
            self.index.publish(new_anchor.clone(), Arc::clone(&held.block));
            self.index.publish(held.anchor.clone(), Arc::clone(&block));
            let anchor = std::mem::replace(&mut held.anchor, new_anchor.clone());
            set.held.insert(
                idx,
                Held {
                    anchor,
                    upper: Some(new_anchor),
                    block,
                    guard,
                },
            );
            return Ok(());
        }

        let first = held
            .guard
            .first_key()?
            .ok_or_else(|| corrupt("full block without records"))?
            .to_vec();
        let (block, guard) = self.adopt(self.fresh_block())?;
        if key > first.as_slice() {
            self.index.publish(key.to_vec(), Arc::clone(&block));
            let upper = std::mem::replace(&mut held.upper, Some(key.to_vec()));
            set.held.insert(
                idx + 1,
                Held {
                    anchor: key.to_vec(),
                    upper,
                    block,
                    guard,
                },
            );
        } else {
            self.index.publish(first.clone(), Arc::clone(&held.block));
            self.index.publish(held.anchor.clone(), Arc::clone(&block));
            let anchor = std::mem::replace(&mut held.anchor, first.clone());
            set.held.insert(
                idx,
                Held {
                    anchor,
                    upper: Some(first),
                    block,
                    guard,
                },
            );
        }
        tracing::debug!(
            target: "bigmap::engine",
            key_len = key.len(),
            "gave record a block of its own"
        );
        Ok(())
    }

    fn fresh_block(&self) -> Block {
        Block::new(
            self.arena.allocate(self.options.initial_block_size),
            self.config,
            Some(Arc::clone(&self.stats)),
        )
    }

    /// Wraps a block that is about to be published and locks it.
    fn adopt(&self, block: Block) -> Result<(Arc<SharedBlock>, BlockWriteGuard)> {
        let shared = SharedBlock::new(block);
        let guard = shared
            .write(shared.stamp())
            .map_err(|Retry| corrupt("unpublished block changed under its creator"))?;
        self.stats.add_blocks(1);
        Ok((shared, guard))
    }

    /// Unlocks all held blocks, returning anchors of those worth merging.
    fn release(&self, set: WriteSet, check_merge: bool) -> SmallVec<[Vec<u8>; 2]> {
        let mut candidates = SmallVec::new();
        if check_merge {
            for held in &set.held {
                if self.underfilled(&held.guard) {
                    candidates.push(held.anchor.clone());
                }
            }
        }
        drop(set);
        candidates
    }

    fn underfilled(&self, block: &Block) -> bool {
        let threshold = self.config.merge_ratio * self.config.ladder.max() as f64 / 2.0;
        (block.used_bytes() as f64) < threshold
    }

    fn merge_candidates(&self, anchors: &[Vec<u8>]) -> Result<()> {
        for anchor in anchors {
            if anchor.is_empty() {
                if let Some(next) = self.index.higher(anchor) {
                    self.merge_into(&next.anchor)?;
                }
            } else {
                self.merge_into(anchor)?;
            }
        }
        Ok(())
    }

    /// Lets the block anchored at `anchor` absorb its left neighbour.
    ///
    /// Opportunistic: gives up instead of retrying when either block moved.
    fn merge_into(&self, anchor: &[u8]) -> Result<bool> {
        let Some(right) = self.index.floor(anchor).filter(|entry| entry.anchor == anchor) else {
            return Ok(false);
        };
        let Some(left) = self.index.lower(anchor) else {
            return Ok(false);
        };
        let (left_seen, right_seen) = (left.block.stamp(), right.block.stamp());
        let Ok(mut left_guard) = left.block.write(left_seen) else {
            return Ok(false);
        };
        let Ok(mut right_guard) = right.block.write(right_seen) else {
            return Ok(false);
        };
        let still_neighbours = self
            .index
            .lower(anchor)
            .is_some_and(|entry| entry.same_block(&left))
            && self
                .index
                .floor(anchor)
                .is_some_and(|entry| entry.same_block(&right));
        if !still_neighbours {
            return Ok(false);
        }
        if !right_guard.merge(&mut left_guard, false, false)? {
            return Ok(false);
        }
        self.index.publish(left.anchor.clone(), Arc::clone(&right.block));
        self.index.retire(&right.anchor, &right.block);
        self.stats.add_blocks(-1);
        Ok(true)
    }

    /// Visits every block in key order under the lock `lock` takes.
    ///
    /// Blocks are visited one at a time, so a concurrent writer may be seen
    /// on either side of a visit.
    fn walk<G, F, V>(&self, lock: F, mut visit: V) -> Result<()>
    where
        F: Fn(&SharedBlock, u64) -> std::result::Result<G, Retry>,
        V: FnMut(&IndexEntry, &mut G) -> Result<()>,
    {
        let mut cursor = self.resolve(|index| index.first(), &lock);
        while let Some(mut located) = cursor {
            visit(&located.entry, &mut located.guard)?;
            // the end of a locked block's range stays put until it is unlocked
            let next = self.index.higher(&located.entry.anchor);
            drop(located);
            cursor = match next {
                Some(next) => self.resolve(|index| index.floor(&next.anchor), &lock),
                None => None,
            };
        }
        Ok(())
    }
}

impl std::fmt::Debug for BigSortedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSortedMap")
            .field("blocks", &self.index.len())
            .field("allocated", &self.arena.allocated_bytes())
            .finish()
    }
}

fn run_operation<O, G>(op: &mut O, located: &Located<G>, updates: &mut Updates) -> Result<bool>
where
    O: Operation + ?Sized,
    G: Deref<Target = Block>,
{
    let found = match located.found {
        Some(off) => {
            let rec = located.guard.record_at(off)?;
            Some(FoundRecord {
                key: rec.key,
                value: rec.value,
            })
        }
        None => None,
    };
    op.execute(found, updates)
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(BigMapError::Invalid("key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(BigMapError::Invalid("key longer than 32767 bytes"));
    }
    Ok(())
}

fn corrupt(reason: &'static str) -> BigMapError {
    tracing::error!(target: "bigmap::engine", reason, "engine invariant violated");
    BigMapError::Corruption(reason)
}

#[cfg(test)]
mod tests;
