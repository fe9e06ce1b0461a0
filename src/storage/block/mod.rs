#![forbid(unsafe_code)]

//! Bounded byte regions holding sorted runs of records.
//!
//! A [`Block`] owns one arena region and keeps its records contiguous and
//! ordered by key. Deletion only sets a tombstone bit; space comes back when
//! the block compacts. A full block grows along a [`SizeLadder`] and, once the
//! ladder is exhausted, asks its owner to split it.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::primitives::arena::Region;
use crate::storage::stats::EngineStats;
use crate::types::{BigMapError, Result};

pub mod record;
mod shared;

pub use record::{RecordRef, MAX_KEY_LEN, MAX_VALUE_LEN, RECORD_HEADER_LEN};
pub use shared::{BlockReadGuard, BlockWriteGuard, SharedBlock};

use record::{RecordHeader, RecordIter};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Size classes as sixteenths of the maximum block size.
const LADDER_SIXTEENTHS: [usize; 9] = [1, 2, 4, 6, 8, 10, 12, 14, 16];

/// Fixed ladder of capacities a block may take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeLadder {
    max: usize,
}

impl SizeLadder {
    /// Creates the ladder for blocks of at most `max` bytes.
    pub fn new(max: usize) -> Self {
        Self { max }
    }

    /// Largest capacity on the ladder.
    pub fn max(&self) -> usize {
        self.max
    }

    /// All capacities, ascending.
    pub fn classes(&self) -> impl Iterator<Item = usize> + '_ {
        LADDER_SIXTEENTHS.iter().map(move |s| self.max * s / 16)
    }

    /// Whether `size` is one of the capacities.
    pub fn contains(&self, size: usize) -> bool {
        self.classes().any(|class| class == size)
    }

    /// Next capacity strictly above `size`.
    pub fn next_above(&self, size: usize) -> Option<usize> {
        self.classes().find(|class| *class > size)
    }

    /// Smallest capacity holding at least `bytes`.
    pub fn fitting(&self, bytes: usize) -> Option<usize> {
        self.classes().find(|class| *class >= bytes)
    }
}

/// Per-engine tuning shared by all of its blocks.
#[derive(Clone, Copy, Debug)]
pub struct BlockConfig {
    /// Capacity ladder.
    pub ladder: SizeLadder,
    /// Tombstone ratio above which an unforced compaction runs.
    pub compaction_ratio: f64,
    /// Fraction of the maximum size two neighbours must fit in to merge.
    pub merge_ratio: f64,
}

impl BlockConfig {
    /// Configuration with default ratios for blocks of at most `max` bytes.
    pub fn with_max_size(max: usize) -> Self {
        Self {
            ladder: SizeLadder::new(max),
            compaction_ratio: 0.25,
            merge_ratio: 0.5,
        }
    }
}

/// Result of [`Block::put`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    /// The record was written.
    Done,
    /// Neither compaction nor expansion made enough room.
    NeedsSplit,
}

/// A region holding a sorted run of tombstone-capable records.
pub struct Block {
    id: u64,
    region: Region,
    used: usize,
    records: usize,
    deleted: usize,
    config: BlockConfig,
    stamp: Arc<AtomicU64>,
    stats: Option<Arc<EngineStats>>,
    valid: bool,
}

impl Block {
    /// Creates an empty block over `region`.
    ///
    /// Blocks created with `stats` report data size and record counts to the
    /// engine-wide counters; blocks without are private scratch blocks.
    pub fn new(region: Region, config: BlockConfig, stats: Option<Arc<EngineStats>>) -> Self {
        Self {
            id: NEXT_BLOCK_ID.fetch_add(1, AtomicOrdering::Relaxed),
            region,
            used: 0,
            records: 0,
            deleted: 0,
            config,
            stamp: Arc::new(AtomicU64::new(0)),
            stats,
            valid: true,
        }
    }

    /// Creates a private scratch block that never touches engine counters.
    pub fn scratch(capacity: usize, config: BlockConfig) -> Self {
        Self::new(Region::detached(capacity), config, None)
    }

    /// Process-unique identity of the block.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Bytes occupied by records, tombstones included.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Physical records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Records carrying the tombstone bit.
    pub fn deleted_count(&self) -> usize {
        self.deleted
    }

    /// Records that are not tombstoned.
    pub fn live_count(&self) -> usize {
        self.records - self.deleted
    }

    /// Current value of the change stamp.
    pub fn change_stamp(&self) -> u64 {
        self.stamp.load(AtomicOrdering::Acquire)
    }

    /// Whether the block still owns data (false after being merged away).
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether the block holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Configuration the block was created with.
    pub fn config(&self) -> BlockConfig {
        self.config
    }

    /// Iterates all records, tombstones included.
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter::new(self.data())
    }

    /// Key of the first physical record.
    pub fn first_key(&self) -> Result<Option<&[u8]>> {
        if self.used == 0 {
            return Ok(None);
        }
        Ok(Some(record::decode_at(self.data(), 0)?.key))
    }

    /// Key of the last physical record.
    pub fn last_key(&self) -> Result<Option<&[u8]>> {
        let mut last = None;
        for rec in self.records() {
            last = Some(rec?.key);
        }
        Ok(last)
    }

    /// Offset of the first record whose key is `>= key`, or the end of data.
    pub fn search(&self, key: &[u8]) -> Result<usize> {
        for rec in self.records() {
            let rec = rec?;
            if rec.key >= key {
                return Ok(rec.offset);
            }
        }
        Ok(self.used)
    }

    /// Value of the live record stored under exactly `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        match self.find(key)? {
            Some(off) => Ok(Some(self.record_at(off)?.value)),
            None => Ok(None),
        }
    }

    /// Offset of the live record stored under exactly `key`.
    pub fn find(&self, key: &[u8]) -> Result<Option<usize>> {
        let off = self.search(key)?;
        if off == self.used {
            return Ok(None);
        }
        let rec = record::decode_at(self.data(), off)?;
        if rec.deleted || rec.key != key {
            return Ok(None);
        }
        Ok(Some(off))
    }

    /// Decodes the record starting at `off`.
    pub fn record_at(&self, off: usize) -> Result<RecordRef<'_>> {
        record::decode_at(self.data(), off)
    }

    /// Bytes occupied by live records only.
    pub fn live_bytes(&self) -> Result<usize> {
        let mut total = 0;
        for rec in self.records() {
            let rec = rec?;
            if !rec.deleted {
                total += rec.end() - rec.offset;
            }
        }
        Ok(total)
    }

    /// Greatest live record whose key is `<= key`.
    pub fn floor(&self, key: &[u8]) -> Result<Option<RecordRef<'_>>> {
        let mut found = None;
        for rec in self.records() {
            let rec = rec?;
            if rec.key > key {
                break;
            }
            if !rec.deleted {
                found = Some(rec);
            }
        }
        Ok(found)
    }

    /// Inserts or overwrites `key`.
    ///
    /// Tries compaction and then expansion when the record does not fit;
    /// returns [`PutOutcome::NeedsSplit`] when both fall short.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<PutOutcome> {
        self.ensure_valid()?;
        check_record(key, value, self.config.ladder.max())?;
        let new_len = record::record_len(key.len(), value.len());
        loop {
            let off = self.search(key)?;
            let existing = self.header_if_matches(off, key)?;
            let growth = match existing {
                Some(header) => new_len as isize - header.len() as isize,
                None => new_len as isize,
            };
            if growth > 0 && self.used + growth as usize > self.capacity() {
                if !self.make_room(growth as usize)? {
                    return Ok(PutOutcome::NeedsSplit);
                }
                continue;
            }
            match existing {
                Some(header) => self.overwrite(off, header, key, value),
                None => self.insert_at(off, key, value),
            }
            return Ok(PutOutcome::Done);
        }
    }

    /// Tombstones the live record stored under `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.ensure_valid()?;
        let off = self.search(key)?;
        match self.header_if_matches(off, key)? {
            Some(header) if !header.deleted => {
                record::set_deleted(&mut self.region, off, true);
                self.deleted += 1;
                if let Some(stats) = &self.stats {
                    stats.add_live_records(-1);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Physically removes tombstones except the first record's.
    ///
    /// Runs when the tombstone ratio exceeds the configured threshold or when
    /// `force` is set. Returns whether anything was removed.
    pub fn compact(&mut self, force: bool) -> Result<bool> {
        if self.deleted == 0 || !self.valid {
            return Ok(false);
        }
        let ratio = self.deleted as f64 / self.records as f64;
        if !force && ratio <= self.config.compaction_ratio {
            return Ok(false);
        }
        let first = record::header_at(self.data(), 0)?;
        let mut write = first.len();
        let mut read = first.len();
        let mut removed = 0usize;
        let mut removed_bytes = 0usize;
        while read < self.used {
            let header = record::header_at(self.data(), read)?;
            let len = header.len();
            if header.deleted {
                removed += 1;
                removed_bytes += len;
            } else {
                if write != read {
                    self.region.copy_within(read..read + len, write);
                }
                write += len;
            }
            read += len;
        }
        if removed == 0 {
            return Ok(false);
        }
        self.region[write..self.used].fill(0);
        self.used = write;
        self.records -= removed;
        self.deleted -= removed;
        self.advance_stamp();
        if let Some(stats) = &self.stats {
            stats.add_data_bytes(-(removed_bytes as i64));
            stats.inc_compactions();
        }
        tracing::trace!(
            target: "bigmap::block",
            block = self.id,
            removed,
            removed_bytes,
            "compacted block"
        );
        Ok(true)
    }

    /// Grows the region to the next ladder class.
    pub fn expand(&mut self) -> bool {
        let Some(next) = self.config.ladder.next_above(self.capacity()) else {
            return false;
        };
        let mut region = self.region.sibling(next);
        region[..self.used].copy_from_slice(&self.region[..self.used]);
        self.region = region;
        if let Some(stats) = &self.stats {
            stats.inc_expansions();
        }
        tracing::trace!(
            target: "bigmap::block",
            block = self.id,
            capacity = next,
            "expanded block"
        );
        true
    }

    /// Splits off the lower half of the records into a new sibling.
    ///
    /// The boundary is the record edge nearest half of the used bytes; on a
    /// tie the lower half keeps the record straddling the midpoint. Both
    /// halves keep at least one record. Returns `None` for fewer than two
    /// records.
    pub fn split(&mut self, force_compact: bool) -> Result<Option<Block>> {
        self.ensure_valid()?;
        if force_compact {
            self.compact(true)?;
        }
        if self.records < 2 {
            return Ok(None);
        }
        let mut ends: SmallVec<[(usize, bool); 64]> = SmallVec::with_capacity(self.records);
        let mut off = 0;
        while off < self.used {
            let header = record::header_at(self.data(), off)?;
            off += header.len();
            ends.push((off, header.deleted));
        }
        let half = self.used / 2;
        let mut idx = ends
            .iter()
            .position(|(end, _)| *end >= half)
            .unwrap_or(ends.len() - 1);
        if idx > 0 {
            let prev = ends[idx - 1].0;
            if ends[idx].0 - half > half - prev {
                idx -= 1;
            }
        }
        idx = idx.min(ends.len() - 2);
        let boundary = ends[idx].0;
        let left_records = idx + 1;
        let left_deleted = ends[..=idx].iter().filter(|(_, deleted)| *deleted).count();

        let capacity = self
            .config
            .ladder
            .fitting(boundary)
            .ok_or(BigMapError::Corruption("split half larger than maximum block"))?;
        let mut region = self.region.sibling(capacity);
        region[..boundary].copy_from_slice(&self.region[..boundary]);
        let mut sibling = Block::new(region, self.config, self.stats.clone());
        sibling.used = boundary;
        sibling.records = left_records;
        sibling.deleted = left_deleted;
        sibling.advance_stamp();

        self.region.copy_within(boundary..self.used, 0);
        let remaining = self.used - boundary;
        self.region[remaining..self.used].fill(0);
        self.used = remaining;
        self.records -= left_records;
        self.deleted -= left_deleted;
        self.advance_stamp();
        if let Some(stats) = &self.stats {
            stats.inc_splits();
        }
        tracing::debug!(
            target: "bigmap::block",
            block = self.id,
            sibling = sibling.id,
            left_bytes = boundary,
            right_bytes = remaining,
            "split block"
        );
        Ok(Some(sibling))
    }

    /// Whether `self` and its left neighbour fit together under the merge ratio.
    pub fn should_merge(&self, left: &Block) -> bool {
        let combined = (self.used + left.used) as f64;
        combined <= self.config.merge_ratio * self.config.ladder.max() as f64
    }

    /// Absorbs the left neighbour `left` into `self`.
    ///
    /// `left`'s records end up in front of `self`'s; `left` is invalidated and
    /// its region released. Returns `false` when the blocks do not fit or the
    /// merge ratio test fails without `force_merge`.
    pub fn merge(&mut self, left: &mut Block, force_compact: bool, force_merge: bool) -> Result<bool> {
        self.ensure_valid()?;
        left.ensure_valid()?;
        if let (Some(left_last), Some(first)) = (left.last_key()?, self.first_key()?) {
            if left_last >= first {
                return Err(BigMapError::Invalid("merge sibling is not to the left"));
            }
        }
        if force_compact {
            left.compact(true)?;
            self.compact(true)?;
        }
        let combined = left.used + self.used;
        if combined > self.config.ladder.max() {
            return Ok(false);
        }
        if !force_merge && !self.should_merge(left) {
            return Ok(false);
        }
        while self.capacity() < combined {
            if !self.expand() {
                return Ok(false);
            }
        }
        self.region.copy_within(0..self.used, left.used);
        self.region[..left.used].copy_from_slice(&left.region[..left.used]);
        self.used = combined;
        self.records += left.records;
        self.deleted += left.deleted;
        left.invalidate();
        self.advance_stamp();
        if let Some(stats) = &self.stats {
            stats.inc_merges();
        }
        tracing::debug!(
            target: "bigmap::block",
            block = self.id,
            absorbed = left.id,
            used = self.used,
            "merged blocks"
        );
        Ok(true)
    }

    pub(crate) fn stamp_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.stamp)
    }

    fn data(&self) -> &[u8] {
        &self.region[..self.used]
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(BigMapError::Invalid("block was merged away"))
        }
    }

    fn advance_stamp(&self) {
        self.stamp.fetch_add(1, AtomicOrdering::AcqRel);
    }

    fn invalidate(&mut self) {
        self.region = Region::detached(0);
        self.used = 0;
        self.records = 0;
        self.deleted = 0;
        self.valid = false;
        self.advance_stamp();
    }

    fn header_if_matches(&self, off: usize, key: &[u8]) -> Result<Option<RecordHeader>> {
        if off == self.used {
            return Ok(None);
        }
        let rec = record::decode_at(self.data(), off)?;
        if rec.key != key {
            return Ok(None);
        }
        Ok(Some(RecordHeader {
            key_len: rec.key.len(),
            value_len: rec.value.len(),
            deleted: rec.deleted,
        }))
    }

    fn make_room(&mut self, needed: usize) -> Result<bool> {
        if self.deleted > 0 {
            self.compact(true)?;
        }
        while self.used + needed > self.capacity() {
            if !self.expand() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn overwrite(&mut self, off: usize, old: RecordHeader, key: &[u8], value: &[u8]) {
        let old_len = old.len();
        let new_len = record::record_len(key.len(), value.len());
        if old_len != new_len {
            let tail = off + old_len;
            self.region.copy_within(tail..self.used, off + new_len);
            if new_len < old_len {
                let new_used = self.used - (old_len - new_len);
                self.region[new_used..self.used].fill(0);
            }
        }
        record::encode_at(&mut self.region, off, key, value);
        self.used = self.used + new_len - old_len;
        if old.deleted {
            self.deleted -= 1;
        }
        if let Some(stats) = &self.stats {
            stats.add_data_bytes(new_len as i64 - old_len as i64);
            if old.deleted {
                stats.add_live_records(1);
            }
        }
    }

    fn insert_at(&mut self, off: usize, key: &[u8], value: &[u8]) {
        let len = record::record_len(key.len(), value.len());
        self.region.copy_within(off..self.used, off + len);
        record::encode_at(&mut self.region, off, key, value);
        self.used += len;
        self.records += 1;
        if let Some(stats) = &self.stats {
            stats.add_data_bytes(len as i64);
            stats.add_live_records(1);
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("records", &self.records)
            .field("deleted", &self.deleted)
            .field("stamp", &self.change_stamp())
            .field("valid", &self.valid)
            .finish()
    }
}

/// Validates a record against the layout limits and the maximum block size.
pub fn check_record(key: &[u8], value: &[u8], max_block_size: usize) -> Result<()> {
    if key.is_empty() {
        return Err(BigMapError::Invalid("key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(BigMapError::Invalid("key longer than 32767 bytes"));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(BigMapError::Invalid("value longer than 65535 bytes"));
    }
    if !fits_block(key.len(), value.len(), max_block_size) {
        return Err(BigMapError::Invalid("record larger than maximum block size"));
    }
    Ok(())
}

/// Whether a record of the given shape can ever be stored in one block.
pub fn fits_block(key_len: usize, value_len: usize, max_block_size: usize) -> bool {
    record::record_len(key_len, value_len) <= max_block_size
}
